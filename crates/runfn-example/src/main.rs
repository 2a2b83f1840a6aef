// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! runfn example host
//!
//! Serves [`hello::HelloHandler`] on `RUNFN_PORT` (default 8082). See
//! [`ServerConfig::from_env`] for the remaining settings.

mod hello;

use runfn_sdk::{FunctionServer, ServerConfig, init_subscriber, shutdown_signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let dotenv = dotenvy::dotenv();

    let config = ServerConfig::from_env()?;
    init_subscriber(&config.log_level)?;

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        port = config.port,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        shutdown_timeout = ?config.shutdown_timeout,
        "Starting runfn example"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    FunctionServer::new(config, hello::HelloHandler)?
        .run(shutdown)
        .await?;

    info!("runfn example shut down");
    Ok(())
}
