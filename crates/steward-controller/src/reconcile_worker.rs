// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker driving the reconcilers.
//!
//! Each pass walks every parent, reconciles it, then reconciles its items.
//! Resources that asked to be requeued are skipped until their delay is up;
//! the worker sleeps until the earliest requeue or the pass interval,
//! whichever comes first.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use steward_core::WorkItemStore;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::reconciler::{ItemReconciler, ParentReconciler, ReconcileResult};

/// Lower bound on the sleep between two passes.
const MIN_PASS_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Parent {
        namespace: String,
        name: String,
    },
    Item {
        namespace: String,
        parent: String,
        name: String,
    },
}

/// Counters of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub parents: usize,
    pub items: usize,
    /// Resources skipped because their requeue delay has not elapsed.
    pub deferred: usize,
    pub errors: usize,
    /// Time until the earliest deferred resource is due.
    pub next_due: Option<Duration>,
}

/// Runs reconcile passes until shutdown.
pub struct ReconcileWorker {
    store: Arc<dyn WorkItemStore>,
    parents: ParentReconciler,
    items: ItemReconciler,
    interval: Duration,
    due: Mutex<HashMap<Key, Instant>>,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        parents: ParentReconciler,
        items: ItemReconciler,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            parents,
            items,
            interval,
            due: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Reconcile worker started"
        );

        loop {
            let report = self.reconcile_pass().await;
            let wait = report
                .next_due
                .map_or(self.interval, |due| due.min(self.interval))
                .max(MIN_PASS_DELAY);

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!("Reconcile worker stopped");
    }

    /// Reconcile every due parent and item once.
    pub async fn reconcile_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        let now = Instant::now();
        let mut seen = HashSet::new();

        let parents = match self.store.list_parents().await {
            Ok(parents) => parents,
            Err(e) => {
                error!(error = %e, "Failed to list parents");
                report.errors += 1;
                report.next_due = Some(self.interval);
                return report;
            }
        };

        for parent in parents {
            let key = Key::Parent {
                namespace: parent.namespace.clone(),
                name: parent.name.clone(),
            };
            if self.is_due(&key, now) {
                report.parents += 1;
                match self.parents.reconcile(&parent.namespace, &parent.name).await {
                    Ok(result) => self.schedule(&key, result),
                    Err(e) => {
                        error!(
                            parent = %parent.name,
                            error = %e,
                            code = e.error_code(),
                            "Failed to reconcile parent"
                        );
                        report.errors += 1;
                    }
                }
            } else {
                report.deferred += 1;
            }
            seen.insert(key);

            let items = match self.store.list_items(&parent.namespace, &parent.name).await {
                Ok(items) => items,
                Err(e) => {
                    error!(parent = %parent.name, error = %e, "Failed to list work items");
                    report.errors += 1;
                    continue;
                }
            };

            for stored in items {
                let key = Key::Item {
                    namespace: stored.namespace.clone(),
                    parent: stored.parent.clone(),
                    name: stored.item.name.clone(),
                };
                if self.is_due(&key, now) {
                    report.items += 1;
                    match self
                        .items
                        .reconcile(&stored.namespace, &stored.parent, &stored.item.name)
                        .await
                    {
                        Ok(result) => self.schedule(&key, result),
                        Err(e) => {
                            error!(
                                item = %stored.resource_name(),
                                error = %e,
                                code = e.error_code(),
                                "Failed to reconcile work item"
                            );
                            report.errors += 1;
                        }
                    }
                } else {
                    report.deferred += 1;
                }
                seen.insert(key);
            }
        }

        let mut due = self.due();
        due.retain(|key, _| seen.contains(key));
        let after = Instant::now();
        report.next_due = due
            .values()
            .map(|at| at.saturating_duration_since(after))
            .min();

        debug!(
            parents = report.parents,
            items = report.items,
            deferred = report.deferred,
            errors = report.errors,
            "Reconcile pass finished"
        );
        report
    }

    fn due(&self) -> MutexGuard<'_, HashMap<Key, Instant>> {
        self.due.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_due(&self, key: &Key, now: Instant) -> bool {
        self.due().get(key).is_none_or(|at| *at <= now)
    }

    fn schedule(&self, key: &Key, result: ReconcileResult) {
        let mut due = self.due();
        match result.requeue_after() {
            Some(delay) => {
                due.insert(key.clone(), Instant::now() + delay);
            }
            None => {
                due.remove(key);
            }
        }
    }
}
