//! Level-triggered reconciliation for EBB.
//!
//! This crate turns work items into converging cluster writes:
//!
//! - **Work queue**: pending keys, deduplicated, claimed by one worker at a
//!   time, retried with per-key exponential backoff
//! - **Reconciler**: fetches the namespace fresh and makes sure its managed
//!   Role exists and matches the template
//! - **Controller**: routes watch and external events into the queue and
//!   runs the workers
//!
//! # Outcomes
//!
//! - `Succeeded` - forget the key's backoff
//! - `Requeue(d)` - forget the backoff, look again after `d`
//! - `RequeueImmediate` - add again without growing the backoff
//! - `Error` - add again after the key's backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ebb_core::ShutdownCoordinator;
//! use ebb_reconciler::{
//!     ClusterApi, ControllerBuilder, InMemoryCluster, NamespaceReconciler, ReconcilerConfig,
//!     WorkQueue,
//! };
//!
//! # async fn example() -> ebb_reconciler::Result<()> {
//! let cluster = Arc::new(InMemoryCluster::new());
//! let reconciler = Arc::new(NamespaceReconciler::new(
//!     cluster.clone(),
//!     ReconcilerConfig::default(),
//! )?);
//! let (_tx, rx) = tokio::sync::mpsc::channel(1);
//!
//! let controller = ControllerBuilder::new("sqs", WorkQueue::default(), reconciler)
//!     .watches_primary(cluster.watch_namespaces())
//!     .owns(cluster.watch_roles())
//!     .watches_channel(rx)
//!     .build()?;
//!
//! let shutdown = ShutdownCoordinator::new();
//! let stats = controller.run(shutdown.listener()).await?;
//! # let _ = stats;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod backoff;
pub mod cluster;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod workqueue;

// Re-export main types
pub use backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, ExponentialBackoff};
pub use cluster::{ClusterApi, ClusterError, InMemoryCluster, Mutations, WatchStream};
pub use controller::{
    Controller, ControllerBuilder, ControllerConfig, EventRouter, EventStream, ReconcileStats,
    StatsSnapshot,
};
pub use error::{Error, Result};
pub use reconciler::{
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, NamespaceReconciler, Reconcile, ReconcileOutcome,
    ReconcilerConfig, RoleChange, RoleTemplate,
};
pub use workqueue::{QueueKey, WorkQueue};
