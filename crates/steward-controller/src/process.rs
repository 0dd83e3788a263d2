// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process registration and heartbeats.
//!
//! Lock owners are judged alive through the control plane's
//! `process_exists`. A replica announces itself on start, refreshes its
//! heartbeat while it runs and removes itself on graceful shutdown, so the
//! locks it still holds become free for takeover immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use steward_core::{ControlPlaneError, InMemoryControlPlane};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Liveness bookkeeping for controller processes.
#[async_trait]
pub trait ProcessRegistry: Send + Sync {
    async fn register(&self, process_id: &str) -> Result<(), ControlPlaneError>;

    /// Refresh the last-seen time of `process_id`.
    async fn heartbeat(&self, process_id: &str) -> Result<(), ControlPlaneError>;

    async fn deregister(&self, process_id: &str) -> Result<(), ControlPlaneError>;
}

#[async_trait]
impl ProcessRegistry for InMemoryControlPlane {
    async fn register(&self, process_id: &str) -> Result<(), ControlPlaneError> {
        self.register_process(process_id);
        Ok(())
    }

    async fn heartbeat(&self, process_id: &str) -> Result<(), ControlPlaneError> {
        self.register_process(process_id);
        Ok(())
    }

    async fn deregister(&self, process_id: &str) -> Result<(), ControlPlaneError> {
        self.remove_process(process_id);
        Ok(())
    }
}

/// Background worker keeping this process registered.
pub struct ProcessHeartbeat {
    registry: Arc<dyn ProcessRegistry>,
    process_id: String,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ProcessHeartbeat {
    pub fn new(
        registry: Arc<dyn ProcessRegistry>,
        process_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            process_id: process_id.into(),
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Register, heartbeat until shutdown, then deregister.
    pub async fn run(&self) {
        info!(
            process_id = %self.process_id,
            interval_secs = self.interval.as_secs(),
            "Process heartbeat started"
        );

        if let Err(e) = self.registry.register(&self.process_id).await {
            error!(process_id = %self.process_id, error = %e, "Failed to register process");
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Process heartbeat received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    match self.registry.heartbeat(&self.process_id).await {
                        Ok(()) => debug!(process_id = %self.process_id, "Heartbeat sent"),
                        Err(e) => warn!(process_id = %self.process_id, error = %e, "Failed to send heartbeat"),
                    }
                }
            }
        }

        if let Err(e) = self.registry.deregister(&self.process_id).await {
            error!(process_id = %self.process_id, error = %e, "Failed to deregister process");
        }

        info!(process_id = %self.process_id, "Process heartbeat stopped");
    }
}
