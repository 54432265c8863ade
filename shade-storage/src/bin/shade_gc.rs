//! Thin CLI front-end for `shade_storage::gc`: loads a
//! backend from a config file, runs one GC pass, and prints the report.

use std::path::PathBuf;

use clap::Parser;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;

use shade_storage::config::{build_backend, Config};
use shade_storage::gc::{self, GcOptions};

#[derive(Parser)]
#[command(name = "shade-gc", about = "Runs one garbage-collection pass against a Shade backend configuration")]
struct Args {
    /// Path to a JSON `Config` document.
    #[arg(long)]
    config: PathBuf,
    /// Overrides the default of 100 obsolete manifests per run.
    #[arg(long)]
    max_files_delete: Option<usize>,
    /// Overrides the default of 100 unreferenced chunks per run.
    #[arg(long)]
    max_chunks_delete: Option<usize>,
    /// PEM-encoded RSA private key, required if the configured backend
    /// chain includes an `encrypt` layer.
    #[arg(long)]
    rsa_private_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config_bytes = tokio::fs::read(&args.config).await?;
    let config = Config::from_json(&config_bytes)?;
    let backend = build_backend(&config).await?;

    let private_key = match &args.rsa_private_key {
        Some(path) => {
            let pem = tokio::fs::read_to_string(path).await?;
            let key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
                .map_err(|e| anyhow::anyhow!("malformed RSA private key at {}: {e}", path.display()))?;
            Some(key)
        }
        None => None,
    };

    let mut opts = GcOptions::default();
    if let Some(v) = args.max_files_delete {
        opts.max_files_delete = v;
    }
    if let Some(v) = args.max_chunks_delete {
        opts.max_chunks_delete = v;
    }

    let report = gc::run(&backend, private_key.as_ref(), opts).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
