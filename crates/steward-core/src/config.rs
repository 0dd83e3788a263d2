// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for steward-core.

use std::time::Duration;

use crate::cache::CacheConfig;
use crate::graph::{CompletionPolicies, CompletionPolicy};
use crate::janitor::DEFAULT_JANITOR_INTERVAL;
use crate::lock::{DEFAULT_LOCK_PREFIX, DEFAULT_NOT_LOCKED_REQUEUE};
use crate::timeout::{Timeout, TimeoutConfig, parse_duration};

/// Coordination settings shared by every component of a replica.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this replica; written into the lock records it holds.
    pub process_id: String,
    /// Prefix of lock record names (`<prefix>-<uid>`).
    pub lock_prefix: String,
    /// Time between two lock janitor sweeps.
    pub janitor_interval: Duration,
    /// Stall detection limits.
    pub timeouts: TimeoutConfig,
    /// Delay before retrying a target this replica could not lock.
    pub not_locked_requeue: Duration,
    /// Bounded cache limits.
    pub cache: CacheConfig,
    /// Dependency completion policy per parent kind.
    pub completion_policies: CompletionPolicies,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            process_id: default_process_id(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
            timeouts: TimeoutConfig::default(),
            not_locked_requeue: DEFAULT_NOT_LOCKED_REQUEUE,
            cache: CacheConfig::default(),
            completion_policies: CompletionPolicies::default(),
        }
    }
}

impl Config {
    /// Load configuration from `STEWARD_*` environment variables.
    ///
    /// Every variable is optional; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let process_id = std::env::var("STEWARD_PROCESS_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.process_id);

        let lock_prefix = match std::env::var("STEWARD_LOCK_PREFIX") {
            Ok(prefix) if prefix.is_empty() || prefix.contains('-') => {
                return Err(ConfigError::Invalid {
                    var: "STEWARD_LOCK_PREFIX",
                    reason: "prefix must be non-empty and must not contain '-'".to_string(),
                });
            }
            Ok(prefix) => prefix,
            Err(_) => defaults.lock_prefix,
        };

        let timeouts = TimeoutConfig {
            pickup: env_timeout("STEWARD_PICKUP_TIMEOUT", defaults.timeouts.pickup)?,
            abort: env_timeout("STEWARD_ABORT_TIMEOUT", defaults.timeouts.abort)?,
            progressing_default: env_timeout(
                "STEWARD_PROGRESSING_TIMEOUT",
                defaults.timeouts.progressing_default,
            )?,
        };

        let max_size_bytes = match std::env::var("STEWARD_CACHE_MAX_SIZE_BYTES") {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "STEWARD_CACHE_MAX_SIZE_BYTES",
                reason: format!("'{}' is not a byte count", raw),
            })?,
            Err(_) => defaults.cache.max_size_bytes,
        };

        let cache = CacheConfig {
            max_size_bytes,
            outdated_duration: env_duration(
                "STEWARD_CACHE_OUTDATED_DURATION",
                defaults.cache.outdated_duration,
            )?,
            ..defaults.cache
        };

        let completion_policies = CompletionPolicies {
            installation: env_policy(
                "STEWARD_INSTALLATION_COMPLETION_POLICY",
                defaults.completion_policies.installation,
            )?,
            execution: env_policy(
                "STEWARD_EXECUTION_COMPLETION_POLICY",
                defaults.completion_policies.execution,
            )?,
        };

        Ok(Self {
            process_id,
            lock_prefix,
            janitor_interval: env_duration("STEWARD_JANITOR_INTERVAL", defaults.janitor_interval)?,
            timeouts,
            not_locked_requeue: env_duration(
                "STEWARD_NOT_LOCKED_REQUEUE",
                defaults.not_locked_requeue,
            )?,
            cache,
            completion_policies,
        })
    }
}

/// `<hostname>-<uuid>` so two replicas on one host never share an identity.
fn default_process_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "steward".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

/// Read a duration variable, falling back to `default` when unset.
pub fn env_duration(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse_duration(&raw).map_err(|e| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_timeout(var: &'static str, default: Timeout) -> Result<Timeout, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: humantime::DurationError| {
            ConfigError::Invalid {
                var,
                reason: e.to_string(),
            }
        }),
        Err(_) => Ok(default),
    }
}

fn env_policy(
    var: &'static str,
    default: CompletionPolicy,
) -> Result<CompletionPolicy, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|reason: String| ConfigError::Invalid { var, reason }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds a value that cannot be used.
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
