//! Queue consumer for EBB.
//!
//! Long-polls an SQS-compatible queue and turns each `{"namespace": ...}`
//! message into a [`ebb_events::GenericEvent`] on a bounded channel.
//!
//! - [`QueueClient`]: receive/delete contract, implemented by
//!   [`SqsQueueClient`] (AWS SDK, signed), [`HttpQueueClient`] (unsigned
//!   JSON protocol) and [`InMemoryQueue`]
//! - [`QueuePoller`]: the poll loop
//! - [`QueueConfig`] / [`AckPolicy`]: what to poll and whether to delete

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod poller;
pub mod sqs;

pub use client::{HttpQueueClient, QueueClient};
pub use config::{AckPolicy, MAX_BATCH_SIZE, MAX_WAIT_TIME, QueueClientKind, QueueConfig};
pub use error::{Error, Result};
pub use memory::InMemoryQueue;
pub use message::{QueueMessage, RawMessage};
pub use poller::{BatchReport, QueuePoller};
pub use sqs::SqsQueueClient;
