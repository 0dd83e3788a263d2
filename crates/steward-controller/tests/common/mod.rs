// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for steward-controller integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use steward_controller::process::ProcessRegistry;
use steward_controller::reconciler::{ItemReconciler, ItemWorker, ParentReconciler, WorkerError};
use steward_controller::sqlite::SqliteControlPlane;
use steward_core::{
    CompletionPolicies, Locker, ParentKind, ParentRecord, StallDetector, StoredItem,
    TimeoutConfig, WorkItem, WorkItemStore, WorkState,
};

pub const NAMESPACE: &str = "default";
pub const PROCESS_ID: &str = "p1";
pub const REQUEUE: Duration = Duration::from_secs(1);

/// In-memory SQLite backend with `p1` registered.
pub async fn sqlite_backend() -> Arc<SqliteControlPlane> {
    let backend = Arc::new(
        SqliteControlPlane::in_memory()
            .await
            .expect("Failed to create in-memory control plane"),
    );
    backend.register(PROCESS_ID).await.unwrap();
    backend
}

pub fn item(name: &str, deps: &[&str]) -> WorkItem {
    WorkItem::new(name).with_dependencies(deps.iter().copied())
}

/// Store an execution with `items` and start `job_id` on it.
pub async fn seed_execution(
    store: &dyn WorkItemStore,
    name: &str,
    items: Vec<WorkItem>,
    job_id: &str,
) -> ParentRecord {
    let parent = store
        .create_parent(&ParentRecord::new(NAMESPACE, name, ParentKind::Execution))
        .await
        .unwrap();
    for item in items {
        store
            .create_item(&StoredItem::new(NAMESPACE, name, item))
            .await
            .unwrap();
    }
    start_job(store, name, job_id).await
}

pub async fn start_job(store: &dyn WorkItemStore, name: &str, job_id: &str) -> ParentRecord {
    let mut parent = store.get_parent(NAMESPACE, name).await.unwrap().unwrap();
    let version = parent.version;
    parent.start_job(job_id, Utc::now());
    store.update_parent(&parent, version).await.unwrap()
}

pub async fn request_deletion(store: &dyn WorkItemStore, name: &str, job_id: &str) -> ParentRecord {
    let mut parent = store.get_parent(NAMESPACE, name).await.unwrap().unwrap();
    let version = parent.version;
    parent.request_deletion(job_id, Utc::now());
    store.update_parent(&parent, version).await.unwrap()
}

/// Abort the running job as if requested at `at`.
pub async fn request_abort(
    store: &dyn WorkItemStore,
    name: &str,
    at: DateTime<Utc>,
) -> ParentRecord {
    let mut parent = store.get_parent(NAMESPACE, name).await.unwrap().unwrap();
    let version = parent.version;
    parent.request_abort(at);
    store.update_parent(&parent, version).await.unwrap()
}

pub struct Reconcilers {
    pub parents: ParentReconciler,
    pub items: ItemReconciler,
}

pub fn reconcilers(
    backend: Arc<SqliteControlPlane>,
    worker: Arc<dyn ItemWorker>,
    timeouts: TimeoutConfig,
) -> Reconcilers {
    let locker = Locker::new(backend.clone(), PROCESS_ID, "di");
    Reconcilers {
        parents: ParentReconciler::new(
            backend.clone(),
            locker.clone(),
            CompletionPolicies::default(),
            REQUEUE,
        ),
        items: ItemReconciler::new(
            backend,
            locker,
            StallDetector::new(timeouts),
            worker,
            CompletionPolicies::default(),
            REQUEUE,
        ),
    }
}

/// Reconcile the parent and then its items, up to `rounds` times, until the
/// parent finished its job or disappeared.
pub async fn drive(
    store: &dyn WorkItemStore,
    reconcilers: &Reconcilers,
    name: &str,
    rounds: usize,
) -> Option<ParentRecord> {
    for _ in 0..rounds {
        reconcilers.parents.reconcile(NAMESPACE, name).await.unwrap();
        for stored in store.list_items(NAMESPACE, name).await.unwrap() {
            reconcilers
                .items
                .reconcile(NAMESPACE, name, &stored.item.name)
                .await
                .unwrap();
        }
        match store.get_parent(NAMESPACE, name).await.unwrap() {
            Some(parent) if parent.status.is_finished() => return Some(parent),
            Some(_) => {}
            None => return None,
        }
    }
    store.get_parent(NAMESPACE, name).await.unwrap()
}

/// Worker with per-item answers that records every poll.
#[derive(Default)]
pub struct ScriptedWorker {
    states: Mutex<HashMap<String, WorkState>>,
    errors: Mutex<HashSet<String>>,
    polls: Mutex<Vec<(String, bool)>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, item: &str, state: WorkState) {
        self.states.lock().unwrap().insert(item.to_string(), state);
    }

    pub fn fail(&self, item: &str) {
        self.errors.lock().unwrap().insert(item.to_string());
    }

    /// Items in the order they were first polled; `deleting` selects the
    /// polls made while tearing down.
    pub fn first_polls(&self, deleting: bool) -> Vec<String> {
        let mut seen = Vec::new();
        for (name, d) in self.polls.lock().unwrap().iter() {
            if *d == deleting && !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        seen
    }
}

#[async_trait]
impl ItemWorker for ScriptedWorker {
    async fn poll(
        &self,
        _parent: &ParentRecord,
        item: &StoredItem,
    ) -> Result<WorkState, WorkerError> {
        let name = item.item.name.clone();
        self.polls
            .lock()
            .unwrap()
            .push((name.clone(), item.item.phase.is_deletion()));

        if self.errors.lock().unwrap().contains(&name) {
            return Err(format!("worker for {} crashed", name).into());
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(&name)
            .copied()
            .unwrap_or(WorkState::Completed))
    }
}
