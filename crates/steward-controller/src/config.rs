// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for steward-controller.

use std::time::Duration;

use steward_core::config::{Config, ConfigError, env_duration};

/// Default SQLite database, created next to the working directory.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.data/steward.db?mode=rwc";

/// Default time between two reconcile passes over all parents.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time between two process heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default age after which a process without heartbeat counts as dead.
pub const DEFAULT_PROCESS_STALE_AFTER: Duration = Duration::from_secs(60);

/// Controller configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Coordination settings (lock prefix, timeouts, cache, ...).
    pub core: Config,
    /// SQLite connection URL of the shared control plane.
    pub database_url: String,
    pub reconcile_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which lock owners are considered dead.
    ///
    /// Must be larger than `heartbeat_interval`, otherwise live replicas
    /// would lose their locks between two heartbeats.
    pub process_stale_after: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            core: Config::default(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            process_stale_after: DEFAULT_PROCESS_STALE_AFTER,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let core = Config::from_env()?;

        let database_url = std::env::var("STEWARD_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let reconcile_interval =
            env_duration("STEWARD_RECONCILE_INTERVAL", DEFAULT_RECONCILE_INTERVAL)?;
        let heartbeat_interval =
            env_duration("STEWARD_HEARTBEAT_INTERVAL", DEFAULT_HEARTBEAT_INTERVAL)?;
        let process_stale_after =
            env_duration("STEWARD_PROCESS_STALE_AFTER", DEFAULT_PROCESS_STALE_AFTER)?;

        if reconcile_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "STEWARD_RECONCILE_INTERVAL",
                reason: "interval must be greater than zero".to_string(),
            });
        }
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "STEWARD_HEARTBEAT_INTERVAL",
                reason: "interval must be greater than zero".to_string(),
            });
        }
        if process_stale_after <= heartbeat_interval {
            return Err(ConfigError::Invalid {
                var: "STEWARD_PROCESS_STALE_AFTER",
                reason: format!(
                    "must be larger than the heartbeat interval ({:?})",
                    heartbeat_interval
                ),
            });
        }

        Ok(Self {
            core,
            database_url,
            reconcile_interval,
            heartbeat_interval,
            process_stale_after,
        })
    }
}
