//! Assembles one running Shade mount point: parses a `Config` document,
//! builds the backend tree via the provider registry, constructs the
//! path index and inode map, and starts the filesystem request
//! dispatcher plus its periodic refresh task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use shade_storage::backend::Backend;
use shade_storage::config::{build_backend, Config};
use shade_storage::fs::FsServer;
use shade_storage::inode::InodeMap;
use shade_storage::tree::Tree;

/// Everything a daemon invocation needs beyond what's in the `Config`
/// document itself: how often to refresh the tree and the chunk size to
/// open files with when the config doesn't imply one already.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config_path: PathBuf,
    pub refresh_interval: Duration,
    /// `0` defers to `FsServer`'s own default.
    pub chunksize: u64,
    /// Whether the configured backend chain terminates in an `Encrypt`
    /// layer — the daemon needs to know this itself because `FsServer`
    /// generates a file's `AesKey` on first flush only when told to.
    pub encrypted: bool,
}

impl DaemonConfig {
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "shade").map(|dirs| dirs.config_dir().join("config.json"))
    }
}

/// A fully wired mount: the dispatcher plus the background task that
/// keeps its tree current. Dropping this stops the refresh task.
pub struct Daemon {
    pub server: Arc<FsServer>,
    pub tree: Arc<Tree>,
    pub inodes: Arc<InodeMap>,
    refresh_task: tokio::task::JoinHandle<()>,
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

/// Builds a [`Daemon`] from a config file path without starting the
/// "run until shutdown" wait — used directly by tests and by anything
/// embedding the daemon rather than running it as the top-level process.
pub async fn build(cfg: &DaemonConfig) -> Result<Daemon> {
    let config = load_config(&cfg.config_path).await?;
    let backend = build_backend(&config)
        .await
        .with_context(|| format!("building backend tree from {}", cfg.config_path.display()))?;

    info!(backend = %backend.describe().name, persistent = backend.describe().persistent, "backend ready");

    let tree = Arc::new(Tree::new(backend.clone()));
    tree.refresh().await.context("initial tree refresh")?;
    info!(nodes = tree.num_nodes(), "initial tree refresh complete");

    let inodes = Arc::new(InodeMap::new());
    let server = Arc::new(FsServer::new(backend, tree.clone(), inodes.clone(), cfg.chunksize, cfg.encrypted));
    let refresh_task = tree.spawn_periodic_refresh(cfg.refresh_interval);

    Ok(Daemon {
        server,
        tree,
        inodes,
        refresh_task,
    })
}

async fn load_config(path: &Path) -> Result<Config> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading config document at {}", path.display()))?;
    Config::from_json(&bytes).with_context(|| format!("parsing config document at {}", path.display()))
}

/// Builds the daemon and blocks until the process receives a shutdown
/// signal. The kernel-facing transport that would actually drive
/// `daemon.server` lives outside this crate: here the daemon just stays
/// up so an embedder's transport binding can call into it.
pub async fn run(cfg: DaemonConfig) -> Result<()> {
    let daemon = build(&cfg).await?;
    info!(config = %cfg.config_path.display(), "shade daemon running, waiting for shutdown signal");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    drop(daemon);
    Ok(())
}
