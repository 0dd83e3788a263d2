// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that removes orphaned lock records.
//!
//! Unlocking keeps the record, so records pile up as targets come and go.
//! A record is orphaned when its target no longer exists, or when the target
//! was recreated under a new UID and the record name no longer matches
//! `<prefix>-<current uid>`. Records with another prefix belong to another
//! subsystem and are left alone.
//!
//! Every replica runs a janitor. The first sweep is delayed by a random
//! fraction of the interval so replicas started together do not sweep in
//! lockstep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlane;
use crate::lock::{LockRecord, lock_name};

/// Default time between sweeps (3 hours).
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(3 * 3600);

/// Configuration for the lock janitor.
#[derive(Debug, Clone)]
pub struct LockJanitorConfig {
    pub interval: Duration,
    /// Delay the first sweep by a random fraction of `interval`.
    pub startup_jitter: bool,
}

impl Default for LockJanitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_JANITOR_INTERVAL,
            startup_jitter: true,
        }
    }
}

/// Counters of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub namespaces: usize,
    pub inspected: usize,
    pub deleted: usize,
    /// Deletions that failed; retried next sweep.
    pub failed: usize,
    /// Records skipped because their target could not be resolved.
    pub skipped: usize,
}

/// Deletes lock records whose target is gone.
pub struct LockJanitor {
    control_plane: Arc<dyn ControlPlane>,
    prefix: String,
    config: LockJanitorConfig,
    shutdown: Arc<Notify>,
}

impl LockJanitor {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        prefix: impl Into<String>,
        config: LockJanitorConfig,
    ) -> Self {
        Self {
            control_plane,
            prefix: prefix.into(),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the janitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        let jitter = if self.config.startup_jitter {
            self.config.interval.mul_f64(rand::random::<f64>())
        } else {
            Duration::ZERO
        };

        info!(
            interval_secs = self.config.interval.as_secs(),
            jitter_secs = jitter.as_secs(),
            prefix = %self.prefix,
            "Lock janitor started"
        );

        tokio::select! {
            biased;

            _ = self.shutdown.notified() => {
                info!("Lock janitor stopped before first sweep");
                return;
            }

            _ = tokio::time::sleep(jitter) => {}
        }

        loop {
            let report = self.sweep().await;
            if report.deleted > 0 || report.failed > 0 {
                info!(
                    inspected = report.inspected,
                    deleted = report.deleted,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Lock janitor sweep finished"
                );
            } else {
                debug!(inspected = report.inspected, "Lock janitor sweep found nothing to delete");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Lock janitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("Lock janitor stopped");
    }

    /// Inspect every lock record once and delete the orphaned ones.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let namespaces = match self.control_plane.list_lock_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                error!(error = %e, "Failed to list lock namespaces");
                return report;
            }
        };
        report.namespaces = namespaces.len();

        for namespace in namespaces {
            let records = match self.control_plane.list_locks(&namespace).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "Failed to list locks, skipping namespace");
                    continue;
                }
            };

            for record in records {
                if !self.owns(&record) {
                    continue;
                }
                report.inspected += 1;

                match self.is_orphaned(&record).await {
                    Some(true) => {}
                    Some(false) => continue,
                    None => {
                        report.skipped += 1;
                        continue;
                    }
                }

                match self
                    .control_plane
                    .delete_lock(&record.namespace, &record.name)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            lock = %record.name,
                            namespace = %record.namespace,
                            target = %record.target_name,
                            "Deleted orphaned lock"
                        );
                        report.deleted += 1;
                    }
                    Err(e) => {
                        error!(lock = %record.name, namespace = %record.namespace, error = %e, "Failed to delete orphaned lock");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    fn owns(&self, record: &LockRecord) -> bool {
        record
            .name
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// `None` when the target could not be looked up.
    async fn is_orphaned(&self, record: &LockRecord) -> Option<bool> {
        match self
            .control_plane
            .resource_uid(record.target_kind, &record.namespace, &record.target_name)
            .await
        {
            Ok(None) => Some(true),
            Ok(Some(uid)) => Some(lock_name(&self.prefix, &uid) != record.name),
            Err(e) => {
                warn!(lock = %record.name, target = %record.target_name, error = %e, "Failed to resolve lock target");
                None
            }
        }
    }
}
