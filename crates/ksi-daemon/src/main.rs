//! KSI daemon binary.

use anyhow::{Context, Result};
use clap::Parser;
use ksi_core::config::KsiConfig;
use ksi_daemon::Daemon;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// KSI daemon - event dispatch for cooperating agents
#[derive(Parser, Debug)]
#[command(name = "ksi-daemon")]
#[command(about = "Event-dispatch daemon for cooperating LLM agents")]
#[command(version)]
struct Args {
    /// Path to configuration file (default: $KSI_HOME/ksi.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let cfg = KsiConfig::resolve(args.config.as_deref()).context("failed to resolve configuration")?;
    info!("KSI daemon starting (home: {})", cfg.home_dir.display());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    Daemon::new(cfg).run(cancel).await
}
