// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Controller - one replica of the coordination control loop.
//!
//! Connects to the shared SQLite control plane, registers this process and
//! runs the reconcile worker, the lock janitor and the process heartbeat
//! until Ctrl-C.

use std::sync::Arc;
use tracing::{info, warn};

use steward_controller::config::ControllerConfig;
use steward_controller::runtime::ControllerRuntime;
use steward_controller::sqlite::SqliteControlPlane;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "steward_controller=info,steward_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = ControllerConfig::from_env()?;

    info!(
        process_id = %config.core.process_id,
        database_url = %config.database_url,
        lock_prefix = %config.core.lock_prefix,
        "Starting Steward Controller"
    );

    let backend = Arc::new(
        SqliteControlPlane::connect(&config.database_url)
            .await?
            .with_stale_after(config.process_stale_after),
    );

    info!("Connected to database");

    let runtime = ControllerRuntime::builder()
        .backend(backend)
        .config(config.core)
        .reconcile_interval(config.reconcile_interval)
        .heartbeat_interval(config.heartbeat_interval)
        .build()?
        .start()
        .await?;

    info!(process_id = %runtime.process_id(), "Controller ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Steward Controller shut down");

    Ok(())
}
