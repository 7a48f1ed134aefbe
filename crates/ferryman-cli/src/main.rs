//! ferryman - HTTP egress filtering proxy.
//!
//! Binds the listener, lowers the file configuration into the runtime
//! config, and runs the proxy until a shutdown signal arrives. The
//! built-in role extractor reads the role header; deployments that
//! authenticate clients some other way embed `ferryman-proxy` directly
//! and supply their own `RoleFromRequest`.

mod cli;
mod config;

use clap::Parser;
use cli::Cli;
use config::{FileConfig, SetupError};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        error!("{}", err);
        eprintln!("ferryman: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SetupError> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = Arc::new(file.into_config()?);

    let listener = TcpListener::bind((cli.ip, cli.port)).await?;

    // The quit side stays open for the process lifetime; shutdown comes
    // from signals.
    let (_quit_tx, quit_rx) = mpsc::channel(1);
    ferryman_proxy::serve(config, listener, quit_rx).await?;
    Ok(())
}
