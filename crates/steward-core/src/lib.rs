// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Core - coordination for replicated controllers
//!
//! Several controller replicas reconcile the same set of resources. This
//! crate provides what they need to cooperate without a leader:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`lock`] | Per-resource locks whose ownership follows process liveness |
//! | [`janitor`] | Periodic removal of lock records whose target is gone |
//! | [`graph`] | Validation and scheduling of dependent work items |
//! | [`phase`] | Phase state machine for work items and their parents |
//! | [`timeout`] | Pickup, abort and progressing timeouts |
//! | [`cache`] | Size-bounded, age-limited cache for resolved artifacts |
//! | [`control_plane`] | The shared store replicas coordinate through |
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  replica A   │   │  replica B   │   │  replica C   │
//! │ Locker       │   │ Locker       │   │ Locker       │
//! │ LockJanitor  │   │ LockJanitor  │   │ LockJanitor  │
//! │ reconcilers  │   │ reconcilers  │   │ reconcilers  │
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                   ControlPlane                      │
//! │   lock records · process liveness · work items      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Replicas never talk to each other. All coordination goes through
//! version-checked writes on the control plane.

pub mod cache;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod graph;
pub mod janitor;
pub mod lock;
pub mod phase;
pub mod timeout;
pub mod work_item;

pub use cache::{BoundedCache, CacheConfig, CacheStats, cache_key};
pub use config::Config;
pub use control_plane::{ControlPlane, ControlPlaneError, InMemoryControlPlane, WorkItemStore};
pub use error::{Error, Result};
pub use graph::{Classification, CompletionPolicies, CompletionPolicy, GraphError, WorkItemGraph};
pub use janitor::{LockJanitor, LockJanitorConfig, SweepReport};
pub use lock::{LockGuard, LockOutcome, LockRecord, Locker, TargetKind, TargetRef};
pub use phase::{Phase, PhaseError, PhaseInput, PhaseMachine, Transition, WorkState};
pub use timeout::{StallCheck, StallDetector, StallReason, Timeout, TimeoutConfig};
pub use work_item::{ItemKind, ParentKind, ParentRecord, StoredItem, WorkItem, WorkItemError};
