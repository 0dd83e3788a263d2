// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconcilers for parents and their work items.
//!
//! Both reconcilers follow the same shape: read the resource, return early
//! when its current job is finished, take the resource's lock (or ask to be
//! requeued), re-read under the lock, compute one phase step and write it
//! back with the version that was read. The lock is released on every exit
//! path.
//!
//! The parent reconciler validates the item graph, triggers items whose
//! dependencies are satisfied and derives the parent's own phase from its
//! items. It only writes an item while holding that item's lock. An abort
//! requested on the parent is passed on to its running items and stops
//! further triggering. The item reconciler checks stall limits, asks the [`ItemWorker`]
//! how the item's work is going and steps the item's phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use steward_core::graph::join_errors;
use steward_core::{
    CompletionPolicies, Locker, ParentRecord, Phase, PhaseInput, PhaseMachine, StallCheck,
    StallDetector, StoredItem, WorkItemGraph, WorkItemStore, WorkState,
};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Error type item workers report.
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Performs the actual work behind an item and reports its progress.
///
/// `poll` is called on every reconciliation of an item that was picked up.
/// Items in a deletion phase expect the worker to tear their work down.
/// An item with `abort_requested_at` set should be stopped and reported as
/// [`WorkState::Failed`]; it is failed with `AbortingTimeout` otherwise.
#[async_trait]
pub trait ItemWorker: Send + Sync {
    async fn poll(
        &self,
        parent: &ParentRecord,
        item: &StoredItem,
    ) -> std::result::Result<WorkState, WorkerError>;
}

/// Worker whose work is always done.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateWorker;

#[async_trait]
impl ItemWorker for ImmediateWorker {
    async fn poll(
        &self,
        _parent: &ParentRecord,
        _item: &StoredItem,
    ) -> std::result::Result<WorkState, WorkerError> {
        Ok(WorkState::Completed)
    }
}

/// What the caller should do after a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Nothing to do until the resource changes.
    Done,
    /// Reconcile again after the delay.
    RequeueAfter(Duration),
}

impl ReconcileResult {
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            ReconcileResult::Done => None,
            ReconcileResult::RequeueAfter(delay) => Some(*delay),
        }
    }

    /// Requeue after the shorter of `self` and `delay`.
    fn at_most(self, delay: Option<Duration>) -> Self {
        match (self, delay) {
            (ReconcileResult::RequeueAfter(current), Some(delay)) => {
                ReconcileResult::RequeueAfter(current.min(delay))
            }
            (ReconcileResult::Done, Some(delay)) => ReconcileResult::RequeueAfter(delay),
            (result, None) => result,
        }
    }
}

/// Reconciles the work items of all parents.
pub struct ItemReconciler {
    store: Arc<dyn WorkItemStore>,
    locker: Locker,
    detector: StallDetector,
    worker: Arc<dyn ItemWorker>,
    policies: CompletionPolicies,
    requeue_interval: Duration,
}

impl ItemReconciler {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        locker: Locker,
        detector: StallDetector,
        worker: Arc<dyn ItemWorker>,
        policies: CompletionPolicies,
        requeue_interval: Duration,
    ) -> Self {
        Self {
            store,
            locker,
            detector,
            worker,
            policies,
            requeue_interval,
        }
    }

    /// Reconcile the item `item` of parent `parent`.
    pub async fn reconcile(
        &self,
        namespace: &str,
        parent: &str,
        item: &str,
    ) -> Result<ReconcileResult> {
        let Some(parent_record) = self.store.get_parent(namespace, parent).await? else {
            return Ok(ReconcileResult::Done);
        };
        let Some(stored) = self.store.get_item(namespace, parent, item).await? else {
            return Ok(ReconcileResult::Done);
        };
        if stored.item.job_id.is_empty() || stored.item.is_finished() {
            return Ok(ReconcileResult::Done);
        }

        let target = stored.target(parent_record.kind.child_kind());
        let Some(guard) = self.locker.lock(&target).await? else {
            debug!(item = %stored.resource_name(), "Item locked by another process");
            return Ok(ReconcileResult::RequeueAfter(
                self.locker.not_locked_requeue(),
            ));
        };

        let result = self.reconcile_locked(&parent_record, namespace, parent, item).await;
        guard.release().await;
        result
    }

    async fn reconcile_locked(
        &self,
        parent: &ParentRecord,
        namespace: &str,
        parent_name: &str,
        item_name: &str,
    ) -> Result<ReconcileResult> {
        let Some(mut stored) = self.store.get_item(namespace, parent_name, item_name).await? else {
            return Ok(ReconcileResult::Done);
        };
        if stored.item.is_finished() {
            return Ok(ReconcileResult::Done);
        }

        let now = Utc::now();
        let version = stored.version;
        let name = stored.resource_name();

        if let StallCheck::Stalled(reason) = self.detector.check(&stored.item, now) {
            warn!(item = %name, phase = %stored.item.phase, reason = %reason, "Work item stalled");
            stored.item.fail(&reason, now);
            return self.write(stored, version).await;
        }

        let deleting = stored.item.phase.is_deletion();
        let siblings: Vec<_> = self
            .store
            .list_items(namespace, parent_name)
            .await?
            .into_iter()
            .map(|s| s.item)
            .collect();
        let graph = WorkItemGraph::new(siblings);
        let Some(index) = graph.index_of(item_name) else {
            return Ok(ReconcileResult::Done);
        };

        let dependencies_ready = if deleting {
            !graph.has_dependents(index)
        } else {
            graph.dependencies_ready(
                index,
                &stored.item.job_id,
                self.policies.for_kind(parent.kind),
            )?
        };

        let work = if stored.item.phase.is_awaiting_pickup() {
            WorkState::Running
        } else {
            match self.worker.poll(parent, &stored).await {
                Ok(work) => work,
                Err(e) => {
                    warn!(item = %name, error = %e, "Item worker failed");
                    let operation = if deleting { "Delete" } else { "Reconcile" };
                    stored
                        .item
                        .fail_with(operation, "WorkerError", e.to_string(), now);
                    return self.write(stored, version).await;
                }
            }
        };

        let mut input = PhaseInput::new(dependencies_ready, work);
        if deleting {
            input = input.deleting();
        }
        let job_id = stored.item.job_id.clone();
        let machine = PhaseMachine::new(parent.kind.child_kind());
        let transition = machine.step(&mut stored.item, &job_id, input, now)?;

        if transition.changed() {
            info!(
                item = %name,
                job_id = %job_id,
                from = %transition.from,
                to = %transition.to,
                "Work item phase changed"
            );
        }

        if deleting && transition.to == Phase::Succeeded {
            self.store
                .delete_item(namespace, parent_name, item_name)
                .await?;
            info!(item = %name, "Work item deleted");
            return Ok(ReconcileResult::Done);
        }

        self.write(stored, version).await
    }

    async fn write(&self, stored: StoredItem, version: u64) -> Result<ReconcileResult> {
        match self.store.update_item(&stored, version).await {
            Ok(updated) => {
                if updated.item.is_finished() {
                    return Ok(ReconcileResult::Done);
                }
                let stall = self.detector.check(&updated.item, Utc::now());
                Ok(ReconcileResult::RequeueAfter(self.requeue_interval).at_most(stall.requeue_after()))
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(item = %stored.resource_name(), error = %e, "Work item changed concurrently");
                Ok(ReconcileResult::RequeueAfter(Duration::ZERO))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reconciles parents: validates their graph and schedules their items.
pub struct ParentReconciler {
    store: Arc<dyn WorkItemStore>,
    locker: Locker,
    policies: CompletionPolicies,
    requeue_interval: Duration,
}

impl ParentReconciler {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        locker: Locker,
        policies: CompletionPolicies,
        requeue_interval: Duration,
    ) -> Self {
        Self {
            store,
            locker,
            policies,
            requeue_interval,
        }
    }

    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileResult> {
        let Some(parent) = self.store.get_parent(namespace, name).await? else {
            return Ok(ReconcileResult::Done);
        };
        if parent.job_id().is_empty() || parent.status.is_finished() {
            return Ok(ReconcileResult::Done);
        }

        let Some(guard) = self.locker.lock(&parent.target()).await? else {
            debug!(parent = %name, "Parent locked by another process");
            return Ok(ReconcileResult::RequeueAfter(
                self.locker.not_locked_requeue(),
            ));
        };

        let result = self.reconcile_locked(namespace, name).await;
        guard.release().await;
        result
    }

    async fn reconcile_locked(&self, namespace: &str, name: &str) -> Result<ReconcileResult> {
        let Some(mut parent) = self.store.get_parent(namespace, name).await? else {
            return Ok(ReconcileResult::Done);
        };
        if parent.status.is_finished() {
            return Ok(ReconcileResult::Done);
        }

        let now = Utc::now();
        let version = parent.version;
        let job_id = parent.job_id().to_string();
        let deleting = parent.deletion_requested;

        let items = self.store.list_items(namespace, name).await?;
        let graph = WorkItemGraph::new(items.iter().map(|s| s.item.clone()).collect());

        let errors = graph.validate();
        if !errors.is_empty() {
            let message = join_errors(&errors);
            warn!(parent = %name, errors = %message, "Work item graph is invalid");
            parent
                .status
                .fail_with("Validate", "InvalidGraph", message, now);
            return self.write(parent, version).await;
        }

        let classification = if deleting {
            graph.classify_for_delete(&job_id)
        } else {
            graph.classify(&job_id, self.policies.for_kind(parent.kind))?
        };

        let abort_requested_at = parent.status.abort_requested_at.filter(|_| !deleting);
        let mut triggered = 0;
        let mut skipped = 0;
        if let Some(requested_at) = abort_requested_at {
            for &index in &classification.running {
                let mut stored = items[index].clone();
                if stored.item.abort_requested_at.is_some() {
                    continue;
                }
                stored.item.request_abort(requested_at);
                if self.write_item(&parent, &stored).await? {
                    info!(
                        parent = %name,
                        item = %stored.item.name,
                        job_id = %job_id,
                        "Work item abort requested"
                    );
                }
            }
        } else {
            for &index in &classification.runnable {
                let mut stored = items[index].clone();
                stored.item.trigger(&job_id, now, deleting);
                if self.write_item(&parent, &stored).await? {
                    triggered += 1;
                    info!(
                        parent = %name,
                        item = %stored.item.name,
                        job_id = %job_id,
                        deleting,
                        "Work item triggered"
                    );
                } else {
                    skipped += 1;
                }
            }
        }

        let settled = !classification.has_running_items() && triggered == 0 && skipped == 0;
        if settled
            && abort_requested_at.is_some()
            && !classification.has_failed_items()
            && !classification.all_succeeded()
        {
            warn!(parent = %name, job_id = %job_id, "Job aborted before all work items ran");
            parent.status.fail_with(
                "Abort",
                "Aborted",
                "the job was aborted before all work items finished",
                now,
            );
            return self.write(parent, version).await;
        }

        let work = if !settled {
            WorkState::Running
        } else if classification.has_failed_items() {
            WorkState::Failed
        } else if deleting {
            if graph.is_empty() {
                WorkState::Completed
            } else {
                WorkState::Running
            }
        } else if classification.all_succeeded() {
            WorkState::Completed
        } else {
            WorkState::Running
        };

        let mut input = PhaseInput::new(true, work);
        if deleting {
            input = input.deleting();
        }
        let machine = PhaseMachine::new(parent.kind.item_kind());
        let transition = machine.step(&mut parent.status, &job_id, input, now)?;

        if transition.changed() {
            info!(
                parent = %name,
                kind = %parent.kind,
                job_id = %job_id,
                from = %transition.from,
                to = %transition.to,
                "Parent phase changed"
            );
        }

        if deleting && transition.to == Phase::Succeeded {
            self.store.delete_parent(namespace, name).await?;
            info!(parent = %name, "Parent deleted");
            return Ok(ReconcileResult::Done);
        }

        self.write(parent, version).await
    }

    /// Write `stored` while holding the item's lock. Returns `false` when
    /// another process holds the item or it changed concurrently.
    async fn write_item(&self, parent: &ParentRecord, stored: &StoredItem) -> Result<bool> {
        let target = stored.target(parent.kind.child_kind());
        let Some(guard) = self.locker.lock(&target).await? else {
            debug!(item = %stored.resource_name(), "Work item locked by another process");
            return Ok(false);
        };
        let result = self.store.update_item(stored, stored.version).await;
        guard.release().await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(item = %stored.resource_name(), error = %e, "Work item changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, parent: ParentRecord, version: u64) -> Result<ReconcileResult> {
        match self.store.update_parent(&parent, version).await {
            Ok(updated) if updated.status.is_finished() => Ok(ReconcileResult::Done),
            Ok(_) => Ok(ReconcileResult::RequeueAfter(self.requeue_interval)),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(parent = %parent.name, error = %e, "Parent changed concurrently");
                Ok(ReconcileResult::RequeueAfter(Duration::ZERO))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_keeps_the_shorter_delay() {
        let ten = Duration::from_secs(10);
        let five = Duration::from_secs(5);

        assert_eq!(
            ReconcileResult::RequeueAfter(ten).at_most(Some(five)),
            ReconcileResult::RequeueAfter(five)
        );
        assert_eq!(
            ReconcileResult::RequeueAfter(five).at_most(Some(ten)),
            ReconcileResult::RequeueAfter(five)
        );
        assert_eq!(
            ReconcileResult::Done.at_most(Some(ten)),
            ReconcileResult::RequeueAfter(ten)
        );
        assert_eq!(ReconcileResult::Done.at_most(None), ReconcileResult::Done);
        assert_eq!(ReconcileResult::RequeueAfter(ten).requeue_after(), Some(ten));
    }
}
