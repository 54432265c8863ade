//! `shade-node`: the daemon binary. Parses its own flags (config path,
//! refresh interval, log level), then hands off to [`shade_node::daemon`].
//! Parsing the *host transport's* flags (mount point, FUSE options) is
//! left to whatever binds a kernel-level filesystem transport on top of
//! this daemon.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shade_node::daemon::{self, DaemonConfig};

#[derive(Parser, Debug)]
#[command(name = "shade-node", about = "Shade storage engine daemon")]
struct Cli {
    /// Path to a JSON `Config` document. Defaults to the
    /// platform config directory's `shade/config.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// How often the in-memory tree re-scans the backend's manifests.
    #[arg(long, default_value = "30")]
    refresh_interval_secs: u64,

    /// Chunk size in bytes for newly created files. `0` defers to the
    /// filesystem server's built-in default.
    #[arg(long, default_value = "0")]
    chunksize: u64,

    /// Set when the configured backend chain terminates in an `encrypt`
    /// layer, so newly created files get a fresh `AesKey` on first flush.
    #[arg(long)]
    encrypted: bool,

    /// `tracing-subscriber` env-filter directive, e.g. `info` or
    /// `shade_storage=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = cli
        .config
        .or_else(DaemonConfig::default_config_path)
        .ok_or_else(|| anyhow::anyhow!("--config not given and no platform config directory could be determined"))?;

    daemon::run(DaemonConfig {
        config_path,
        refresh_interval: Duration::from_secs(cli.refresh_interval_secs),
        chunksize: cli.chunksize,
        encrypted: cli.encrypted,
    })
    .await
}
