//! Long-polling queue consumer.
//!
//! The poller never talks to the cluster. It turns every decodable message
//! into a [`GenericEvent`] carrying the target key and hands it to the event
//! router through a bounded channel. A full channel blocks the poller, which
//! is the only backpressure between the queue and the work queue.

use std::sync::Arc;

use ebb_core::ShutdownListener;
use ebb_events::GenericEvent;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::client::QueueClient;
use crate::config::{AckPolicy, QueueConfig};
use crate::error::{Error, Result};
use crate::message::RawMessage;

/// What one receive/dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages returned by the receive call
    pub received: usize,
    /// Events accepted by the channel
    pub dispatched: usize,
    /// Messages skipped because they could not be decoded
    pub rejected: usize,
    /// Messages deleted from the queue
    pub acknowledged: usize,
}

/// Queue consumer feeding the event channel.
pub struct QueuePoller {
    client: Arc<dyn QueueClient>,
    sender: mpsc::Sender<GenericEvent>,
    config: QueueConfig,
}

impl QueuePoller {
    /// Create a poller.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the polling settings are invalid.
    pub fn new(
        client: Arc<dyn QueueClient>,
        sender: mpsc::Sender<GenericEvent>,
        config: QueueConfig,
    ) -> Result<Self> {
        config.validate_polling()?;
        Ok(Self {
            client,
            sender,
            config,
        })
    }

    /// The poller's configuration.
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Poll until shutdown.
    ///
    /// Receive failures are logged and retried on the next tick. Shutdown
    /// interrupts both the receive call and a send blocked on a full
    /// channel; messages received but not dispatched become visible again
    /// once their visibility timeout expires.
    ///
    /// # Errors
    ///
    /// Returns `Error::ChannelClosed` once the router side of the channel is
    /// gone while no shutdown was requested.
    pub async fn run(&self, mut shutdown: ShutdownListener) -> Result<()> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            wait_time_secs = self.config.wait_time.as_secs(),
            max_messages = self.config.max_messages,
            ack_policy = ?self.config.ack_policy,
            "Queue poller started"
        );

        loop {
            tokio::select! {
                biased;
                signal = shutdown.recv() => {
                    info!(signal = %signal, "Queue poller stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                biased;
                signal = shutdown.recv() => {
                    info!(signal = %signal, "Queue poller stopping mid-batch");
                    return Ok(());
                }
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(report) if report.received > 0 => {
                    debug!(
                        received = report.received,
                        dispatched = report.dispatched,
                        rejected = report.rejected,
                        acknowledged = report.acknowledged,
                        "Processed batch"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Failed to receive messages, retrying on next tick");
                }
                Err(e) if shutdown.is_shutdown() => {
                    info!(error = %e, "Queue poller stopping, event channel closed");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Queue poller stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Run exactly one receive/dispatch cycle.
    ///
    /// # Errors
    ///
    /// Returns the receive error, or `Error::ChannelClosed` if an event
    /// could not be handed over.
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let messages = self
            .client
            .receive(self.config.max_messages, self.config.wait_time)
            .await?;

        let mut report = BatchReport {
            received: messages.len(),
            ..BatchReport::default()
        };

        for message in &messages {
            match message.to_event() {
                Ok(event) => {
                    let key = event.key.clone();
                    self.sender
                        .send(event)
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    report.dispatched = report.dispatched.saturating_add(1);
                    debug!(message_id = %message.message_id, key = %key, "Dispatched event");
                }
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        body = %message.body,
                        error = %e,
                        "Skipping undecodable message"
                    );
                    report.rejected = report.rejected.saturating_add(1);
                }
            }

            if self.acknowledge(message).await {
                report.acknowledged = report.acknowledged.saturating_add(1);
            }
        }

        Ok(report)
    }

    async fn acknowledge(&self, message: &RawMessage) -> bool {
        match self.config.ack_policy {
            AckPolicy::Retain => false,
            AckPolicy::DeleteAfterDispatch => {
                match self.client.delete(&message.receipt_handle).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to delete message, it will be redelivered"
                        );
                        false
                    }
                }
            }
        }
    }
}
