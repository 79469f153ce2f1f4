use std::net::SocketAddr;

use anyhow::Context;
use args::Args;
use clap::Parser;
use config::Config;
use server::ServeConfig;
use tokio_util::sync::CancellationToken;

mod args;

const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:8000";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    server::logger::init(&args.log);

    let config = if args.config.exists() {
        Config::load(&args.config).with_context(|| format!("failed to load {}", args.config.display()))?
    } else {
        log::warn!(
            "Configuration file {} not found, using defaults",
            args.config.display()
        );

        Config::default()
    };

    let listen_address = match args.listen_address.or(config.server.listen_address) {
        Some(address) => address,
        None => DEFAULT_LISTEN_ADDRESS.parse::<SocketAddr>()?,
    };

    let shutdown_signal = CancellationToken::new();

    tokio::spawn({
        let shutdown_signal = shutdown_signal.clone();

        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                return;
            }

            log::info!("Received Ctrl-C, shutting down");
            shutdown_signal.cancel();
        }
    });

    log::info!("Starting agentgate {}", env!("CARGO_PKG_VERSION"));

    server::serve(ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter: args.log,
    })
    .await?;

    Ok(())
}
