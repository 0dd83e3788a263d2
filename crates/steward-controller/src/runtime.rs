// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for a steward controller replica.
//!
//! [`ControllerRuntime`] wires the coordination layer to a backend and runs
//! three background tasks: the process heartbeat, the lock janitor and the
//! reconcile worker.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use steward_controller::runtime::ControllerRuntime;
//! use steward_controller::sqlite::SqliteControlPlane;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = Arc::new(SqliteControlPlane::from_path(".data/steward.db").await?);
//!
//!     let runtime = ControllerRuntime::builder()
//!         .backend(backend)
//!         .worker(Arc::new(MyWorker::new()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use steward_core::{
    BoundedCache, Config, ControlPlane, LockJanitor, LockJanitorConfig, Locker, StallDetector,
    WorkItemStore,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONCILE_INTERVAL};
use crate::process::{ProcessHeartbeat, ProcessRegistry};
use crate::reconcile_worker::ReconcileWorker;
use crate::reconciler::{ImmediateWorker, ItemReconciler, ItemWorker, ParentReconciler};

/// Builder for creating a [`ControllerRuntime`].
pub struct ControllerRuntimeBuilder {
    control_plane: Option<Arc<dyn ControlPlane>>,
    store: Option<Arc<dyn WorkItemStore>>,
    registry: Option<Arc<dyn ProcessRegistry>>,
    worker: Arc<dyn ItemWorker>,
    cache: Option<Arc<BoundedCache>>,
    config: Config,
    reconcile_interval: Duration,
    heartbeat_interval: Duration,
    janitor_startup_jitter: bool,
}

impl Default for ControllerRuntimeBuilder {
    fn default() -> Self {
        Self {
            control_plane: None,
            store: None,
            registry: None,
            worker: Arc::new(ImmediateWorker),
            cache: None,
            config: Config::default(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            janitor_startup_jitter: true,
        }
    }
}

impl ControllerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one backend for locks, work items and process liveness.
    pub fn backend<B>(mut self, backend: Arc<B>) -> Self
    where
        B: ControlPlane + WorkItemStore + ProcessRegistry + 'static,
    {
        let control_plane: Arc<dyn ControlPlane> = backend.clone();
        let store: Arc<dyn WorkItemStore> = backend.clone();
        let registry: Arc<dyn ProcessRegistry> = backend;
        self.control_plane = Some(control_plane);
        self.store = Some(store);
        self.registry = Some(registry);
        self
    }

    /// Set the control plane holding lock records (required).
    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Set the work-item store (required).
    pub fn store(mut self, store: Arc<dyn WorkItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the process registry used for heartbeats (required).
    pub fn registry(mut self, registry: Arc<dyn ProcessRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the worker performing item work.
    ///
    /// Default: [`ImmediateWorker`]
    pub fn worker(mut self, worker: Arc<dyn ItemWorker>) -> Self {
        self.worker = worker;
        self
    }

    /// Share an existing cache instead of creating one from the config.
    pub fn cache(mut self, cache: Arc<BoundedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the coordination settings.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Default: 30 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Default: 10 seconds
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Delay the first janitor sweep by a random fraction of its interval.
    ///
    /// Default: `true`
    pub fn janitor_startup_jitter(mut self, enabled: bool) -> Self {
        self.janitor_startup_jitter = enabled;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ControllerRuntimeConfig> {
        let control_plane = self
            .control_plane
            .ok_or_else(|| anyhow::anyhow!("control_plane is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        if self.reconcile_interval.is_zero() {
            anyhow::bail!("reconcile_interval must be greater than zero");
        }

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(BoundedCache::new(self.config.cache.clone())));

        Ok(ControllerRuntimeConfig {
            control_plane,
            store,
            registry,
            worker: self.worker,
            cache,
            config: self.config,
            reconcile_interval: self.reconcile_interval,
            heartbeat_interval: self.heartbeat_interval,
            janitor_startup_jitter: self.janitor_startup_jitter,
        })
    }
}

/// Configuration for a [`ControllerRuntime`].
pub struct ControllerRuntimeConfig {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<dyn WorkItemStore>,
    registry: Arc<dyn ProcessRegistry>,
    worker: Arc<dyn ItemWorker>,
    cache: Arc<BoundedCache>,
    config: Config,
    reconcile_interval: Duration,
    heartbeat_interval: Duration,
    janitor_startup_jitter: bool,
}

impl ControllerRuntimeConfig {
    /// Register this process and spawn the background tasks.
    pub async fn start(self) -> Result<ControllerRuntime> {
        let process_id = self.config.process_id.clone();

        // Locks must never carry an owner that is not registered yet.
        self.registry.register(&process_id).await?;

        let heartbeat = ProcessHeartbeat::new(
            self.registry.clone(),
            process_id.clone(),
            self.heartbeat_interval,
        );
        let heartbeat_shutdown = heartbeat.shutdown_handle();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.run().await;
        });

        let janitor = LockJanitor::new(
            self.control_plane.clone(),
            self.config.lock_prefix.clone(),
            LockJanitorConfig {
                interval: self.config.janitor_interval,
                startup_jitter: self.janitor_startup_jitter,
            },
        );
        let janitor_shutdown = janitor.shutdown_handle();
        let janitor_handle = tokio::spawn(async move {
            janitor.run().await;
        });

        let locker = Locker::new(
            self.control_plane.clone(),
            process_id.clone(),
            self.config.lock_prefix.clone(),
        )
        .with_not_locked_requeue(self.config.not_locked_requeue);

        let parents = ParentReconciler::new(
            self.store.clone(),
            locker.clone(),
            self.config.completion_policies,
            self.reconcile_interval,
        );
        let items = ItemReconciler::new(
            self.store.clone(),
            locker,
            StallDetector::new(self.config.timeouts),
            self.worker.clone(),
            self.config.completion_policies,
            self.reconcile_interval,
        );
        let reconcile_worker =
            ReconcileWorker::new(self.store.clone(), parents, items, self.reconcile_interval);
        let reconcile_shutdown = reconcile_worker.shutdown_handle();
        let reconcile_handle = tokio::spawn(async move {
            reconcile_worker.run().await;
        });

        info!(
            process_id = %process_id,
            lock_prefix = %self.config.lock_prefix,
            reconcile_interval_secs = self.reconcile_interval.as_secs(),
            "ControllerRuntime started"
        );

        Ok(ControllerRuntime {
            process_id,
            cache: self.cache,
            heartbeat_handle,
            janitor_handle,
            reconcile_handle,
            heartbeat_shutdown,
            janitor_shutdown,
            reconcile_shutdown,
        })
    }
}

/// A running controller replica that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControllerRuntime {
    process_id: String,
    cache: Arc<BoundedCache>,
    heartbeat_handle: JoinHandle<()>,
    janitor_handle: JoinHandle<()>,
    reconcile_handle: JoinHandle<()>,
    heartbeat_shutdown: Arc<Notify>,
    janitor_shutdown: Arc<Notify>,
    reconcile_shutdown: Arc<Notify>,
}

impl ControllerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControllerRuntimeBuilder {
        ControllerRuntimeBuilder::new()
    }

    /// Identity this replica writes into the locks it holds.
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Cache shared by the components of this replica.
    pub fn cache(&self) -> &Arc<BoundedCache> {
        &self.cache
    }

    /// Gracefully shut down the runtime.
    ///
    /// The reconcile worker stops first so no lock is taken after the
    /// process deregisters; the heartbeat stops last.
    pub async fn shutdown(self) -> Result<()> {
        info!("ControllerRuntime shutting down...");

        self.reconcile_shutdown.notify_one();
        if let Err(e) = self.reconcile_handle.await {
            error!("Reconcile worker task panicked: {}", e);
        }

        self.janitor_shutdown.notify_one();
        if let Err(e) = self.janitor_handle.await {
            error!("Lock janitor task panicked: {}", e);
        }

        self.heartbeat_shutdown.notify_one();
        if let Err(e) = self.heartbeat_handle.await {
            error!("Process heartbeat task panicked: {}", e);
        }

        info!("ControllerRuntime shutdown complete");
        Ok(())
    }
}
