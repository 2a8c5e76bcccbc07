//! In-memory queue used by tests and local runs.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::client::QueueClient;
use crate::error::{Error, Result};
use crate::message::RawMessage;

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<RawMessage>,
    in_flight: Vec<RawMessage>,
    deleted: Vec<String>,
    pending_failures: u32,
    receive_calls: u64,
    next_id: u64,
    next_delivery: u64,
}

impl State {
    fn next_receipt_handle(&mut self, message_id: &str) -> String {
        self.next_delivery = self.next_delivery.saturating_add(1);
        format!("{message_id}-rh-{}", self.next_delivery)
    }
}

/// Queue double with simplified visibility semantics.
///
/// A received message stays in flight until it is deleted. Calling
/// [`InMemoryQueue::release_in_flight`] stands in for the visibility timeout
/// expiring: every message still in flight becomes deliverable again, with a
/// fresh receipt handle.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message body, returning its message id.
    pub async fn push(&self, body: impl Into<String>) -> String {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.saturating_add(1);
        let message_id = format!("msg-{}", state.next_id);
        let receipt_handle = state.next_receipt_handle(&message_id);
        state
            .ready
            .push_back(RawMessage::new(&message_id, receipt_handle, body));
        message_id
    }

    /// Enqueue a `{"namespace": ...}` message.
    pub async fn push_namespace(&self, namespace: &str) -> String {
        self.push(serde_json::json!({ "namespace": namespace }).to_string())
            .await
    }

    /// Make the next `count` receive calls fail.
    pub async fn fail_next_receives(&self, count: u32) {
        self.state.lock().await.pending_failures = count;
    }

    /// Redeliver every message that was received but not deleted.
    pub async fn release_in_flight(&self) -> usize {
        let mut state = self.state.lock().await;
        let released = std::mem::take(&mut state.in_flight);
        let count = released.len();
        for mut message in released.into_iter().rev() {
            message.receipt_handle = state.next_receipt_handle(&message.message_id);
            state.ready.push_front(message);
        }
        count
    }

    /// Messages waiting to be received.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Messages received and not yet deleted.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Ids of the deleted messages, in deletion order.
    pub async fn deleted(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }

    /// Number of receive calls made so far, failed ones included.
    pub async fn receive_calls(&self) -> u64 {
        self.state.lock().await.receive_calls
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(&self, max_messages: u32, _wait_time: Duration) -> Result<Vec<RawMessage>> {
        let mut state = self.state.lock().await;
        state.receive_calls = state.receive_calls.saturating_add(1);

        if state.pending_failures > 0 {
            state.pending_failures = state.pending_failures.saturating_sub(1);
            return Err(Error::receive_failed("injected receive failure"));
        }

        let take = usize::try_from(max_messages)
            .unwrap_or(usize::MAX)
            .min(state.ready.len());
        let batch: Vec<RawMessage> = state.ready.drain(..take).collect();
        state.in_flight.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let position = state
            .in_flight
            .iter()
            .position(|m| m.receipt_handle == receipt_handle)
            .ok_or_else(|| Error::delete_failed(receipt_handle, "unknown receipt handle"))?;

        let message = state.in_flight.swap_remove(position);
        state.deleted.push(message.message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(20);

    #[tokio::test]
    async fn test_receive_respects_batch_size() -> Result<()> {
        let queue = InMemoryQueue::new();
        for i in 0..12 {
            queue.push_namespace(&format!("team-{i}")).await;
        }

        assert_eq!(queue.receive(10, WAIT).await?.len(), 10);
        assert_eq!(queue.receive(10, WAIT).await?.len(), 2);
        assert!(queue.receive(10, WAIT).await?.is_empty());
        assert_eq!(queue.in_flight_len().await, 12);
        Ok(())
    }

    #[tokio::test]
    async fn test_retained_messages_are_redelivered() -> Result<()> {
        let queue = InMemoryQueue::new();
        queue.push_namespace("team-a").await;

        let first = queue.receive(10, WAIT).await?;
        assert_eq!(queue.release_in_flight().await, 1);
        let second = queue.receive(10, WAIT).await?;

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        let (first, second) = (first.first(), second.first());
        assert_eq!(
            first.map(|m| &m.message_id),
            second.map(|m| &m.message_id)
        );
        assert_ne!(
            first.map(|m| &m.receipt_handle),
            second.map(|m| &m.receipt_handle)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_message_is_not_redelivered() -> Result<()> {
        let queue = InMemoryQueue::new();
        let id = queue.push_namespace("team-a").await;

        let batch = queue.receive(10, WAIT).await?;
        for message in &batch {
            queue.delete(&message.receipt_handle).await?;
        }

        assert_eq!(queue.release_in_flight().await, 0);
        assert!(queue.receive(10, WAIT).await?.is_empty());
        assert_eq!(queue.deleted().await, vec![id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_stale_receipt_handle_is_rejected() -> Result<()> {
        let queue = InMemoryQueue::new();
        queue.push_namespace("team-a").await;

        let batch = queue.receive(10, WAIT).await?;
        queue.release_in_flight().await;

        for message in &batch {
            assert!(queue.delete(&message.receipt_handle).await.is_err());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures() -> Result<()> {
        let queue = InMemoryQueue::new();
        queue.push_namespace("team-a").await;
        queue.fail_next_receives(2).await;

        assert!(queue.receive(10, WAIT).await.is_err());
        assert!(queue.receive(10, WAIT).await.is_err());
        assert_eq!(queue.receive(10, WAIT).await?.len(), 1);
        assert_eq!(queue.receive_calls().await, 3);
        Ok(())
    }
}
