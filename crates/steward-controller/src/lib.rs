// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward Controller - a replica of the steward control loop.
//!
//! Replicas share one SQLite control plane and coordinate only through it:
//! every parent and work item is reconciled under a liveness-aware lock from
//! [`steward_core`], so at most one replica works on a resource at a time.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sqlite`] | SQLite control plane and work-item store |
//! | [`process`] | Process registration and heartbeats |
//! | [`reconciler`] | Parent and work-item reconcilers |
//! | [`reconcile_worker`] | Reconcile loop with per-resource requeue |
//! | [`runtime`] | Embeddable runtime with graceful shutdown |
//! | [`config`] | Environment configuration |

pub mod config;
pub mod error;
pub mod process;
pub mod reconcile_worker;
pub mod reconciler;
pub mod runtime;
pub mod sqlite;

pub use config::ControllerConfig;
pub use error::{Error, Result};
pub use process::{ProcessHeartbeat, ProcessRegistry};
pub use reconcile_worker::{PassReport, ReconcileWorker};
pub use reconciler::{
    ImmediateWorker, ItemReconciler, ItemWorker, ParentReconciler, ReconcileResult, WorkerError,
};
pub use runtime::{ControllerRuntime, ControllerRuntimeBuilder};
pub use sqlite::SqliteControlPlane;
