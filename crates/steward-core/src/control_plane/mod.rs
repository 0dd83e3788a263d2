// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control plane abstraction.
//!
//! Replicas share nothing but the control plane: lock records, the set of
//! live processes, and the parents and work items they reconcile. Every
//! stored record carries a version token; conditional writes fail with
//! [`ControlPlaneError::Conflict`] when the token moved.
//!
//! # Implementations
//!
//! - [`InMemoryControlPlane`]: single-process backend for tests and embedding
//! - `SqliteControlPlane` in steward-controller: shared SQLite database

pub mod memory;

pub use memory::InMemoryControlPlane;

use async_trait::async_trait;

use crate::lock::LockRecord;
use crate::work_item::{ItemKind, ParentRecord, StoredItem};

/// Control plane request errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ControlPlaneError {
    /// A create raced with another writer.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// A conditional write saw a different version token.
    #[error("{kind} '{name}' was modified concurrently (expected version {expected})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
    },

    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The backend itself failed (I/O, database, decoding).
    #[error("Control plane backend error during '{operation}': {details}")]
    Backend { operation: String, details: String },
}

impl ControlPlaneError {
    pub fn backend(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            details: details.to_string(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::Conflict { .. } => "CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Backend { .. } => "BACKEND_ERROR",
        }
    }
}

/// Lock records, process liveness and resource identity.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch one lock record.
    async fn get_lock(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LockRecord>, ControlPlaneError>;

    /// Namespaces holding at least one lock record.
    async fn list_lock_namespaces(&self) -> Result<Vec<String>, ControlPlaneError>;

    async fn list_locks(&self, namespace: &str) -> Result<Vec<LockRecord>, ControlPlaneError>;

    /// Create a record; [`ControlPlaneError::AlreadyExists`] if the name is taken.
    async fn create_lock(&self, record: &LockRecord) -> Result<LockRecord, ControlPlaneError>;

    /// Replace a record only if its version still equals `expected_version`.
    async fn update_lock(
        &self,
        record: &LockRecord,
        expected_version: u64,
    ) -> Result<LockRecord, ControlPlaneError>;

    /// Replace a record regardless of its version.
    async fn write_lock(&self, record: &LockRecord) -> Result<LockRecord, ControlPlaneError>;

    async fn delete_lock(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError>;

    /// Whether the process `process_id` is still running.
    async fn process_exists(&self, process_id: &str) -> Result<bool, ControlPlaneError>;

    /// Current UID of a resource, `None` if it does not exist.
    async fn resource_uid(
        &self,
        kind: ItemKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, ControlPlaneError>;

    async fn resource_exists(
        &self,
        kind: ItemKind,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ControlPlaneError> {
        Ok(self.resource_uid(kind, namespace, name).await?.is_some())
    }
}

/// Parents and their work items.
///
/// Items are listed in creation order, which is the tie-break order of the
/// scheduler.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    async fn create_parent(&self, parent: &ParentRecord) -> Result<ParentRecord, ControlPlaneError>;

    async fn get_parent(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ParentRecord>, ControlPlaneError>;

    async fn list_parents(&self) -> Result<Vec<ParentRecord>, ControlPlaneError>;

    async fn update_parent(
        &self,
        parent: &ParentRecord,
        expected_version: u64,
    ) -> Result<ParentRecord, ControlPlaneError>;

    /// Remove a parent together with its items.
    async fn delete_parent(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError>;

    async fn create_item(&self, item: &StoredItem) -> Result<StoredItem, ControlPlaneError>;

    async fn get_item(
        &self,
        namespace: &str,
        parent: &str,
        name: &str,
    ) -> Result<Option<StoredItem>, ControlPlaneError>;

    async fn list_items(
        &self,
        namespace: &str,
        parent: &str,
    ) -> Result<Vec<StoredItem>, ControlPlaneError>;

    async fn update_item(
        &self,
        item: &StoredItem,
        expected_version: u64,
    ) -> Result<StoredItem, ControlPlaneError>;

    async fn delete_item(
        &self,
        namespace: &str,
        parent: &str,
        name: &str,
    ) -> Result<(), ControlPlaneError>;
}
