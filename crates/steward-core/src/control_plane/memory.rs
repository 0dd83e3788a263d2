// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process control plane.
//!
//! Replicas sharing one `Arc<InMemoryControlPlane>` behave like replicas
//! sharing a real backend: creates race, conditional updates conflict and
//! processes can be registered or removed to simulate crashes.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ControlPlane, ControlPlaneError, WorkItemStore};
use crate::lock::LockRecord;
use crate::work_item::{ItemKind, ParentRecord, StoredItem, split_resource_name};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    locks: BTreeMap<Key, LockRecord>,
    processes: HashSet<String>,
    parents: BTreeMap<Key, ParentRecord>,
    /// Items per (namespace, parent), in creation order.
    items: BTreeMap<Key, Vec<StoredItem>>,
}

/// Control plane kept in memory.
#[derive(Default)]
pub struct InMemoryControlPlane {
    state: Mutex<State>,
    fail_liveness: AtomicBool,
    fail_lock_deletes: AtomicBool,
    liveness_checks: AtomicUsize,
}

impl InMemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a process as running.
    pub fn register_process(&self, process_id: &str) {
        self.state().processes.insert(process_id.to_string());
    }

    /// Forget a process, as if it crashed.
    pub fn remove_process(&self, process_id: &str) {
        self.state().processes.remove(process_id);
    }

    /// Make liveness checks fail with a backend error.
    pub fn set_fail_liveness(&self, fail: bool) {
        self.fail_liveness.store(fail, Ordering::SeqCst);
    }

    /// Make lock deletions fail with a backend error.
    pub fn set_fail_lock_deletes(&self, fail: bool) {
        self.fail_lock_deletes.store(fail, Ordering::SeqCst);
    }

    /// Number of liveness checks served so far.
    pub fn liveness_checks(&self) -> usize {
        self.liveness_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn get_lock(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LockRecord>, ControlPlaneError> {
        Ok(self.state().locks.get(&key(namespace, name)).cloned())
    }

    async fn list_lock_namespaces(&self) -> Result<Vec<String>, ControlPlaneError> {
        let state = self.state();
        let mut namespaces: Vec<String> = state.locks.keys().map(|(ns, _)| ns.clone()).collect();
        namespaces.dedup();
        Ok(namespaces)
    }

    async fn list_locks(&self, namespace: &str) -> Result<Vec<LockRecord>, ControlPlaneError> {
        Ok(self
            .state()
            .locks
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn create_lock(&self, record: &LockRecord) -> Result<LockRecord, ControlPlaneError> {
        let mut state = self.state();
        let k = key(&record.namespace, &record.name);
        if state.locks.contains_key(&k) {
            return Err(ControlPlaneError::AlreadyExists {
                kind: "lock",
                name: record.name.clone(),
            });
        }
        let mut stored = record.clone();
        stored.version = 1;
        state.locks.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update_lock(
        &self,
        record: &LockRecord,
        expected_version: u64,
    ) -> Result<LockRecord, ControlPlaneError> {
        let mut state = self.state();
        let Some(current) = state.locks.get_mut(&key(&record.namespace, &record.name)) else {
            return Err(ControlPlaneError::NotFound {
                kind: "lock",
                name: record.name.clone(),
            });
        };
        if current.version != expected_version {
            return Err(ControlPlaneError::Conflict {
                kind: "lock",
                name: record.name.clone(),
                expected: expected_version,
            });
        }
        let mut stored = record.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn write_lock(&self, record: &LockRecord) -> Result<LockRecord, ControlPlaneError> {
        let mut state = self.state();
        let Some(current) = state.locks.get_mut(&key(&record.namespace, &record.name)) else {
            return Err(ControlPlaneError::NotFound {
                kind: "lock",
                name: record.name.clone(),
            });
        };
        let mut stored = record.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn delete_lock(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        if self.fail_lock_deletes.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::backend("delete_lock", "injected failure"));
        }
        self.state().locks.remove(&key(namespace, name));
        Ok(())
    }

    async fn process_exists(&self, process_id: &str) -> Result<bool, ControlPlaneError> {
        self.liveness_checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_liveness.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::backend(
                "process_exists",
                "injected failure",
            ));
        }
        Ok(self.state().processes.contains(process_id))
    }

    async fn resource_uid(
        &self,
        kind: ItemKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, ControlPlaneError> {
        let state = self.state();
        let uid = match split_resource_name(name) {
            Some((parent, item)) => state
                .parents
                .get(&key(namespace, parent))
                .filter(|p| p.kind.child_kind() == kind)
                .and_then(|_| state.items.get(&key(namespace, parent)))
                .and_then(|items| items.iter().find(|s| s.item.name == item))
                .map(|s| s.uid.clone()),
            None => state
                .parents
                .get(&key(namespace, name))
                .filter(|p| p.kind.item_kind() == kind)
                .map(|p| p.uid.clone()),
        };
        Ok(uid)
    }
}

#[async_trait]
impl WorkItemStore for InMemoryControlPlane {
    async fn create_parent(&self, parent: &ParentRecord) -> Result<ParentRecord, ControlPlaneError> {
        let mut state = self.state();
        let k = key(&parent.namespace, &parent.name);
        if state.parents.contains_key(&k) {
            return Err(ControlPlaneError::AlreadyExists {
                kind: "parent",
                name: parent.name.clone(),
            });
        }
        let mut stored = parent.clone();
        stored.version = 1;
        state.parents.insert(k, stored.clone());
        Ok(stored)
    }

    async fn get_parent(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ParentRecord>, ControlPlaneError> {
        Ok(self.state().parents.get(&key(namespace, name)).cloned())
    }

    async fn list_parents(&self) -> Result<Vec<ParentRecord>, ControlPlaneError> {
        Ok(self.state().parents.values().cloned().collect())
    }

    async fn update_parent(
        &self,
        parent: &ParentRecord,
        expected_version: u64,
    ) -> Result<ParentRecord, ControlPlaneError> {
        let mut state = self.state();
        let Some(current) = state.parents.get_mut(&key(&parent.namespace, &parent.name)) else {
            return Err(ControlPlaneError::NotFound {
                kind: "parent",
                name: parent.name.clone(),
            });
        };
        if current.version != expected_version {
            return Err(ControlPlaneError::Conflict {
                kind: "parent",
                name: parent.name.clone(),
                expected: expected_version,
            });
        }
        let mut stored = parent.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn delete_parent(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state();
        let k = key(namespace, name);
        state.items.remove(&k);
        state.parents.remove(&k);
        Ok(())
    }

    async fn create_item(&self, item: &StoredItem) -> Result<StoredItem, ControlPlaneError> {
        let mut state = self.state();
        let items = state
            .items
            .entry(key(&item.namespace, &item.parent))
            .or_default();
        if items.iter().any(|s| s.item.name == item.item.name) {
            return Err(ControlPlaneError::AlreadyExists {
                kind: "item",
                name: item.resource_name(),
            });
        }
        let mut stored = item.clone();
        stored.version = 1;
        items.push(stored.clone());
        Ok(stored)
    }

    async fn get_item(
        &self,
        namespace: &str,
        parent: &str,
        name: &str,
    ) -> Result<Option<StoredItem>, ControlPlaneError> {
        Ok(self
            .state()
            .items
            .get(&key(namespace, parent))
            .and_then(|items| items.iter().find(|s| s.item.name == name))
            .cloned())
    }

    async fn list_items(
        &self,
        namespace: &str,
        parent: &str,
    ) -> Result<Vec<StoredItem>, ControlPlaneError> {
        Ok(self
            .state()
            .items
            .get(&key(namespace, parent))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_item(
        &self,
        item: &StoredItem,
        expected_version: u64,
    ) -> Result<StoredItem, ControlPlaneError> {
        let mut state = self.state();
        let current = state
            .items
            .get_mut(&key(&item.namespace, &item.parent))
            .and_then(|items| items.iter_mut().find(|s| s.item.name == item.item.name));
        let Some(current) = current else {
            return Err(ControlPlaneError::NotFound {
                kind: "item",
                name: item.resource_name(),
            });
        };
        if current.version != expected_version {
            return Err(ControlPlaneError::Conflict {
                kind: "item",
                name: item.resource_name(),
                expected: expected_version,
            });
        }
        let mut stored = item.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(stored)
    }

    async fn delete_item(
        &self,
        namespace: &str,
        parent: &str,
        name: &str,
    ) -> Result<(), ControlPlaneError> {
        if let Some(items) = self.state().items.get_mut(&key(namespace, parent)) {
            items.retain(|s| s.item.name != name);
        }
        Ok(())
    }
}
