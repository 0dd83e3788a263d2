// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steward-core.
//!
//! Each concern owns a small error enum; [`Error`] unifies them for callers
//! that do not care which layer failed.

use thiserror::Error;

pub use crate::cache::CacheError;
pub use crate::config::ConfigError;
pub use crate::control_plane::ControlPlaneError;
pub use crate::graph::GraphError;
pub use crate::lock::LockError;
pub use crate::phase::PhaseError;

/// Result type using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified steward-core error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control plane request failed.
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Lock acquisition failed.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Dependency graph is invalid.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Phase transition was rejected.
    #[error("Phase error: {0}")]
    Phase(#[from] PhaseError),

    /// Cache operation failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl Error {
    /// Get the error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::ControlPlane(e) => e.error_code(),
            Self::Lock(_) => "LOCK_ERROR",
            Self::Graph(_) => "INVALID_GRAPH",
            Self::Phase(_) => "INVALID_PHASE",
            Self::Cache(_) => "CACHE_ERROR",
        }
    }
}
