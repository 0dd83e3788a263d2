// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness-aware locks on control plane resources.
//!
//! A lock is a record named `<prefix>-<target uid>` in the target's
//! namespace whose `owner` names the holding process. There is no lease:
//! a held lock stays held for as long as its owner process exists, and any
//! replica may take over a record whose owner is gone.
//!
//! ```text
//!   read record ──► absent ──► create ──► AlreadyExists ──► not locked
//!        │                        └─────► locked
//!        ├──► owner == self ──► locked (re-entrant)
//!        └──► other owner ──► alive ──► not locked
//!                        └──► dead ──► update(version) ──► Conflict ──► not locked
//!                                               └──────► locked
//! ```
//!
//! Guards handed out by one [`Locker`] (and its clones) are counted per
//! record: a re-entrant guard does not clear the owner while an outer guard
//! of the same process is still alive.
//!
//! Unlocking clears the owner but keeps the record; the
//! [`LockJanitor`](crate::janitor::LockJanitor) removes records whose target
//! is gone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::work_item::ItemKind;

/// Owner value of records held on behalf of no particular process.
/// Always treated as alive.
pub const NO_POD_OWNER: &str = "no-pod";

/// Default lock record prefix.
pub const DEFAULT_LOCK_PREFIX: &str = "di";

/// Default delay before retrying a target that could not be locked.
pub const DEFAULT_NOT_LOCKED_REQUEUE: Duration = Duration::from_secs(60);

/// Kind of a lockable resource.
pub type TargetKind = ItemKind;

/// The resource a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl TargetRef {
    pub fn new(
        kind: TargetKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

/// Name of the lock record for a target UID.
pub fn lock_name(prefix: &str, uid: &str) -> String {
    format!("{}-{}", prefix, uid)
}

/// A lock record as stored in the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub name: String,
    pub namespace: String,
    /// Process holding the lock; empty when released.
    #[serde(rename = "ownerProcessId", default)]
    pub owner: String,
    pub target_kind: TargetKind,
    pub target_name: String,
    pub last_update_time: DateTime<Utc>,
    /// Store-assigned version token.
    #[serde(skip)]
    pub version: u64,
}

impl LockRecord {
    pub fn new(name: String, target: &TargetRef, owner: &str, now: DateTime<Utc>) -> Self {
        Self {
            name,
            namespace: target.namespace.clone(),
            owner: owner.to_string(),
            target_kind: target.kind,
            target_name: target.name.clone(),
            last_update_time: now,
            version: 0,
        }
    }

    pub fn is_held(&self) -> bool {
        !self.owner.is_empty()
    }
}

/// Lock errors. Contention is not an error; see [`Locker::lock`].
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum LockError {
    #[error("failed to read lock '{name}': {source}")]
    Read {
        name: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("failed to create lock '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: ControlPlaneError,
    },

    #[error("failed to take over lock '{name}': {source}")]
    Takeover {
        name: String,
        #[source]
        source: ControlPlaneError,
    },
}

/// Result of [`Locker::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    Locked(T),
    /// Another live process holds the lock.
    NotLocked { requeue_after: Duration },
}

/// Live guards per `(namespace, lock name)`.
type Holders = Arc<Mutex<HashMap<(String, String), usize>>>;

/// Acquires and releases locks for one process.
#[derive(Clone)]
pub struct Locker {
    control_plane: Arc<dyn ControlPlane>,
    process_id: String,
    prefix: String,
    not_locked_requeue: Duration,
    holders: Holders,
}

impl Locker {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        process_id: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            control_plane,
            process_id: process_id.into(),
            prefix: prefix.into(),
            not_locked_requeue: DEFAULT_NOT_LOCKED_REQUEUE,
            holders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_not_locked_requeue(mut self, delay: Duration) -> Self {
        self.not_locked_requeue = delay;
        self
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Delay a caller should wait before retrying a target it could not lock.
    pub fn not_locked_requeue(&self) -> Duration {
        self.not_locked_requeue
    }

    pub fn lock_name(&self, target: &TargetRef) -> String {
        lock_name(&self.prefix, &target.uid)
    }

    /// Try to lock `target` for this process.
    ///
    /// Returns `Ok(None)` when another live process holds the lock or a
    /// concurrent writer won a race. Never waits.
    pub async fn lock(&self, target: &TargetRef) -> Result<Option<LockGuard>, LockError> {
        let name = self.lock_name(target);

        let existing = self
            .control_plane
            .get_lock(&target.namespace, &name)
            .await
            .map_err(|source| LockError::Read {
                name: name.clone(),
                source,
            })?;

        let Some(mut record) = existing else {
            let record = LockRecord::new(name.clone(), target, &self.process_id, Utc::now());
            return match self.control_plane.create_lock(&record).await {
                Ok(created) => {
                    info!(lock = %name, owner = %self.process_id, target = %target.name, "Lock created");
                    Ok(Some(self.guard(created)))
                }
                Err(e) if e.is_already_exists() => {
                    debug!(lock = %name, "Lock created concurrently by another process");
                    Ok(None)
                }
                Err(source) => Err(LockError::Create { name, source }),
            };
        };

        if record.owner == self.process_id {
            debug!(lock = %name, "Lock already held by this process");
            return Ok(Some(self.guard(record)));
        }

        if self.owner_alive(&record).await {
            debug!(lock = %name, owner = %record.owner, "Lock held by a live process");
            return Ok(None);
        }

        let expected_version = record.version;
        let previous_owner = std::mem::replace(&mut record.owner, self.process_id.clone());
        record.last_update_time = Utc::now();

        match self.control_plane.update_lock(&record, expected_version).await {
            Ok(updated) => {
                info!(
                    lock = %name,
                    owner = %self.process_id,
                    previous_owner = %previous_owner,
                    "Lock taken over"
                );
                Ok(Some(self.guard(updated)))
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(lock = %name, error = %e, "Lock takeover lost a race");
                Ok(None)
            }
            Err(source) => Err(LockError::Takeover { name, source }),
        }
    }

    /// Clear the owner of `record`. Failures are logged, not returned.
    pub async fn unlock(&self, record: LockRecord) {
        release_record(self.control_plane.as_ref(), record).await;
    }

    /// Run `f` while holding the lock on `target`.
    pub async fn with_lock<F, Fut, T>(
        &self,
        target: &TargetRef,
        f: F,
    ) -> Result<LockOutcome<T>, LockError>
    where
        F: FnOnce(LockRecord) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(guard) = self.lock(target).await? else {
            return Ok(LockOutcome::NotLocked {
                requeue_after: self.not_locked_requeue,
            });
        };
        let output = f(guard.record().clone()).await;
        guard.release().await;
        Ok(LockOutcome::Locked(output))
    }

    async fn owner_alive(&self, record: &LockRecord) -> bool {
        if record.owner.is_empty() {
            return false;
        }
        if record.owner == NO_POD_OWNER {
            return true;
        }
        match self.control_plane.process_exists(&record.owner).await {
            Ok(alive) => alive,
            Err(e) => {
                // Unknown liveness counts as alive; the caller retries later.
                warn!(lock = %record.name, owner = %record.owner, error = %e, "Failed to check lock owner liveness");
                true
            }
        }
    }

    fn guard(&self, record: LockRecord) -> LockGuard {
        let key = (record.namespace.clone(), record.name.clone());
        *lock_holders(&self.holders).entry(key).or_insert(0) += 1;
        LockGuard {
            control_plane: self.control_plane.clone(),
            holders: self.holders.clone(),
            record,
            released: false,
        }
    }
}

fn lock_holders(holders: &Holders) -> MutexGuard<'_, HashMap<(String, String), usize>> {
    holders.lock().unwrap_or_else(|e| e.into_inner())
}

async fn release_record(control_plane: &dyn ControlPlane, mut record: LockRecord) {
    record.owner.clear();
    record.last_update_time = Utc::now();
    match control_plane.write_lock(&record).await {
        Ok(_) => debug!(lock = %record.name, "Lock released"),
        Err(e) => error!(lock = %record.name, error = %e, "Failed to release lock"),
    }
}

/// A held lock. Release it with [`release`](Self::release); a guard dropped
/// unreleased is released in the background. The record is only cleared
/// when the last guard of its [`Locker`] goes away.
pub struct LockGuard {
    control_plane: Arc<dyn ControlPlane>,
    holders: Holders,
    record: LockRecord,
    released: bool,
}

impl LockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub async fn release(mut self) {
        self.released = true;
        if self.leave() {
            release_record(self.control_plane.as_ref(), self.record.clone()).await;
        } else {
            debug!(lock = %self.record.name, "Lock still held by an outer guard");
        }
    }

    /// Drop this guard's count; true when it was the last one.
    fn leave(&self) -> bool {
        let mut holders = lock_holders(&self.holders);
        let key = (self.record.namespace.clone(), self.record.name.clone());
        match holders.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                holders.remove(&key);
                true
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("record", &self.record)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released || !self.leave() {
            return;
        }
        // Without a runtime the record stays owned until the owner process
        // disappears and another replica takes it over.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.record.name, "Lock guard dropped outside a runtime");
            return;
        };
        let control_plane = self.control_plane.clone();
        let record = self.record.clone();
        handle.spawn(async move {
            release_record(control_plane.as_ref(), record).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::InMemoryControlPlane;

    fn target() -> TargetRef {
        TargetRef::new(ItemKind::DeployItem, "ns", "exec/a", "u1")
    }

    fn setup(process_id: &str) -> (Arc<InMemoryControlPlane>, Locker) {
        let cp = Arc::new(InMemoryControlPlane::new());
        cp.register_process(process_id);
        let locker = Locker::new(cp.clone(), process_id, "di");
        (cp, locker)
    }

    #[test]
    fn test_lock_record_json_shape() {
        let record = LockRecord::new("di-u1".to_string(), &target(), "p1", Utc::now());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ownerProcessId"], "p1");
        assert_eq!(json["targetKind"], "DeployItem");
        assert_eq!(json["targetName"], "exec/a");
        assert!(json.get("lastUpdateTime").is_some());
        assert!(json.get("version").is_none());
    }

    #[tokio::test]
    async fn test_lock_creates_record() {
        let (cp, locker) = setup("p1");
        let guard = locker.lock(&target()).await.unwrap().unwrap();
        assert_eq!(guard.name(), "di-u1");

        let stored = cp.get_lock("ns", "di-u1").await.unwrap().unwrap();
        assert_eq!(stored.owner, "p1");
        assert_eq!(stored.target_kind, ItemKind::DeployItem);
        guard.release().await;
    }

    #[tokio::test]
    async fn test_lock_is_reentrant() {
        let (_cp, locker) = setup("p1");
        let first = locker.lock(&target()).await.unwrap().unwrap();
        let second = locker.lock(&target()).await.unwrap();
        assert!(second.is_some());
        first.release().await;
    }

    #[tokio::test]
    async fn test_reentrant_guard_keeps_outer_lock() {
        let (cp, locker) = setup("p1");
        let outer = locker.lock(&target()).await.unwrap().unwrap();
        let inner = locker.clone().lock(&target()).await.unwrap().unwrap();

        inner.release().await;
        let stored = cp.get_lock("ns", "di-u1").await.unwrap().unwrap();
        assert_eq!(stored.owner, "p1");

        outer.release().await;
        let stored = cp.get_lock("ns", "di-u1").await.unwrap().unwrap();
        assert!(!stored.is_held());
    }

    #[tokio::test]
    async fn test_live_owner_blocks() {
        let (cp, p1) = setup("p1");
        cp.register_process("p2");
        let p2 = Locker::new(cp.clone(), "p2", "di");

        let guard = p1.lock(&target()).await.unwrap().unwrap();
        assert!(p2.lock(&target()).await.unwrap().is_none());
        guard.release().await;
    }

    #[tokio::test]
    async fn test_released_record_is_free() {
        let (cp, p1) = setup("p1");
        cp.register_process("p2");
        let p2 = Locker::new(cp.clone(), "p2", "di");

        let guard = p1.lock(&target()).await.unwrap().unwrap();
        guard.release().await;
        let stored = cp.get_lock("ns", "di-u1").await.unwrap().unwrap();
        assert!(!stored.is_held());

        let checks = cp.liveness_checks();
        let guard = p2.lock(&target()).await.unwrap().unwrap();
        assert_eq!(cp.liveness_checks(), checks);
        guard.release().await;
    }

    #[tokio::test]
    async fn test_no_pod_owner_is_never_taken_over() {
        let (cp, locker) = setup("p1");
        let record = LockRecord::new("di-u1".to_string(), &target(), NO_POD_OWNER, Utc::now());
        cp.create_lock(&record).await.unwrap();

        assert!(locker.lock(&target()).await.unwrap().is_none());
        assert_eq!(cp.liveness_checks(), 0);
    }

    #[tokio::test]
    async fn test_liveness_failure_means_not_locked() {
        let (cp, locker) = setup("p1");
        let record = LockRecord::new("di-u1".to_string(), &target(), "p0", Utc::now());
        cp.create_lock(&record).await.unwrap();
        cp.set_fail_liveness(true);

        assert!(locker.lock(&target()).await.unwrap().is_none());
        let stored = cp.get_lock("ns", "di-u1").await.unwrap().unwrap();
        assert_eq!(stored.owner, "p0");
    }

    #[tokio::test]
    async fn test_with_lock_reports_not_locked() {
        let (cp, locker) = setup("p1");
        cp.register_process("p2");
        let other = Locker::new(cp.clone(), "p2", "di")
            .with_not_locked_requeue(Duration::from_secs(7));

        let outcome = locker
            .with_lock(&target(), |record| async move {
                let blocked = other
                    .with_lock(&target(), |_| async {})
                    .await
                    .unwrap();
                (record.owner, blocked)
            })
            .await
            .unwrap();

        let LockOutcome::Locked((owner, blocked)) = outcome else {
            panic!("expected lock to be acquired");
        };
        assert_eq!(owner, "p1");
        assert_eq!(
            blocked,
            LockOutcome::<()>::NotLocked {
                requeue_after: Duration::from_secs(7)
            }
        );
        assert!(!cp.get_lock("ns", "di-u1").await.unwrap().unwrap().is_held());
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let (cp, locker) = setup("p1");
        let guard = locker.lock(&target()).await.unwrap().unwrap();
        drop(guard);

        for _ in 0..50 {
            tokio::task::yield_now().await;
            if !cp.get_lock("ns", "di-u1").await.unwrap().unwrap().is_held() {
                return;
            }
        }
        panic!("dropped guard did not release the lock");
    }
}
