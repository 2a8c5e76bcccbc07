//! # EBB
//!
//! Turns queue messages into level-triggered namespace reconciles.
//!
//! The library side of the `ebb` binary: configuration, the CLI, the
//! Kubernetes adapter and the [`Bridge`] that runs the queue poller and the
//! controller side by side.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bridge;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod telemetry;

pub use bridge::Bridge;
pub use cli::{AckPolicyArg, Cli, QueueClientArg};
pub use cluster::KubeCluster;
pub use config::BridgeConfig;
pub use telemetry::{LogFormat, init_tracing};
