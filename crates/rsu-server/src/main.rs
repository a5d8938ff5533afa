//! RSU gateway daemon entry point: CLI parsing, logging setup, and
//! graceful shutdown on Ctrl-C.

use clap::Parser;
use rsu_server::{Args, ServerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = match ServerConfig::try_from(&args) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    // Ctrl-C closes the listener rather than racing the whole daemon future:
    // `shutdown_tx` is signaled from a background task, and the acceptor
    // selects on the matching receiver to exit its terminal-error path
    // cleanly instead of having the listener simply dropped mid-accept.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    match rsu_server::run(config, shutdown_rx).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "gateway stopped with an error");
            std::process::ExitCode::FAILURE
        }
    }
}
