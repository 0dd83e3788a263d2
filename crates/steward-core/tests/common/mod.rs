// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for steward-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use steward_core::{
    InMemoryControlPlane, ItemKind, Locker, ParentKind, ParentRecord, StoredItem, TargetRef,
    WorkItem, WorkItemStore,
};

/// A control plane shared by `n` live replicas named `p1..pn`.
pub fn replicas(n: usize) -> (Arc<InMemoryControlPlane>, Vec<Locker>) {
    let cp = Arc::new(InMemoryControlPlane::new());
    let lockers = (1..=n)
        .map(|i| {
            let process_id = format!("p{}", i);
            cp.register_process(&process_id);
            Locker::new(cp.clone(), process_id, "di")
        })
        .collect();
    (cp, lockers)
}

pub fn deploy_item_target(uid: &str) -> TargetRef {
    TargetRef::new(ItemKind::DeployItem, "default", "exec/item", uid)
}

pub fn item(name: &str, deps: &[&str]) -> WorkItem {
    WorkItem::new(name).with_dependencies(deps.iter().copied())
}

/// Store an execution with the given items.
pub async fn seed_execution(
    store: &dyn WorkItemStore,
    name: &str,
    items: Vec<WorkItem>,
) -> ParentRecord {
    let parent = store
        .create_parent(&ParentRecord::new("default", name, ParentKind::Execution))
        .await
        .unwrap();
    for item in items {
        store
            .create_item(&StoredItem::new("default", name, item))
            .await
            .unwrap();
    }
    parent
}
