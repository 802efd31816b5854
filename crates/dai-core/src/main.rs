// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAI Adapter - standalone adapter process
//!
//! Registers one adapter instance against the shared store, serves the
//! built-in work items until Ctrl-C (or a fatal work item), then tears the
//! instance down and exits with 0 (normal) or 1 (abnormal).

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use dai_core::{Agent, Config, SqliteGateway};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dai_core=info".parse()?),
        )
        .init();

    info!("Starting DAI adapter");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        adapter_type = %config.adapter_type,
        adapter_name = %config.adapter_name,
        lctn = %config.lctn,
        "Configuration loaded"
    );

    // Connect to the store (migrations run on connect)
    let gateway = Arc::new(SqliteGateway::connect(&config.database_url, config.db_max_connections).await?);
    info!("Database connection established");

    let agent = Agent::from_config(gateway, &config).with_builtin_handlers();

    // Ctrl-C asks the poll loop to stop
    let shutdown = agent.identity().shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    let code = agent.run().await?;
    info!(exit_code = code, "Shutdown complete");
    std::process::exit(code);
}
