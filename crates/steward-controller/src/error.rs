// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steward-controller.

use steward_core::lock::LockError;
use steward_core::{ControlPlaneError, GraphError, PhaseError};
use thiserror::Error;

/// Controller errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Preparing the database location failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Control-plane operation failed.
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Lock acquisition failed.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Phase transition was rejected.
    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),

    /// Dependency graph lookup failed.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),
}

impl Error {
    /// Stable code for logs and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE_ERROR",
            Error::Migrate(_) => "MIGRATION_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::ControlPlane(e) => e.error_code(),
            Error::Lock(_) => "LOCK_ERROR",
            Error::Phase(_) => "INVALID_PHASE",
            Error::Graph(_) => "INVALID_GRAPH",
        }
    }
}

/// Result type using controller Error.
pub type Result<T> = std::result::Result<T, Error>;
