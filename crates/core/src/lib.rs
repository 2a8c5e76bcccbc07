//! Core errors and lifecycle primitives for EBB.
//!
//! Every other crate in the workspace builds on:
//!
//! - [`Error`] / [`Result`]: startup and configuration failures
//! - [`duration`]: serde helpers for `Duration` config fields
//! - [`ShutdownCoordinator`]: the single shutdown authority shared by the
//!   queue poller, the event router and the reconcile workers

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod duration;
pub mod error;
pub mod shutdown;

pub use error::{Error, Result};
pub use shutdown::{
    SHUTDOWN_TIMEOUT, ShutdownCoordinator, ShutdownListener, ShutdownPhase, ShutdownSignal,
    install_signal_handlers,
};
