//! trackerd - Local Host Table membership tracker
//!
//! This daemon validates signed membership messages, maintains the host
//! table and hands buffered deltas to the gossip transport.

use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trackerd::config::Config;
use trackerd::server::Server;

fn init_logging(config: &Config) {
    let default_level = if config.verbose {
        "trackerd=debug"
    } else {
        "trackerd=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "trackerd v{} - Host Membership Tracker",
        env!("CARGO_PKG_VERSION")
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Install signal handler
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        let _ = shutdown.send(());
    });

    // No transport is wired in-process; log what would be gossiped
    if let Some(mut outbound) = server.take_outbound() {
        tokio::spawn(async move {
            while let Some(batch) = outbound.recv().await {
                debug!(
                    "Gossip batch: {} messages to {} neighbors",
                    batch.messages.len(),
                    batch.neighbors.len()
                );
            }
        });
    }

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
