//! Controller runtime: event router plus reconcile workers.
//!
//! The router merges every event source into one stream, maps each event to
//! work items and adds them to the [`WorkQueue`]. Workers claim keys, run the
//! reconciler and feed the outcome back into the queue.
//!
//! On shutdown the router closes the external channels and routes what is
//! still buffered in them, so an event the producer already handed over is
//! not lost. A reconcile that panics counts as a failed reconcile.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ebb_core::ShutdownListener;
use ebb_events::{ControllerEvent, GenericEvent, ObjectKey, Resource, WatchEvent, map_event};
use futures::stream::{BoxStream, SelectAll, select_all};
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, ExponentialBackoff};
use crate::error::{Error, Result};
use crate::reconciler::{Reconcile, ReconcileOutcome};
use crate::workqueue::WorkQueue;

/// Stream of tagged controller events.
pub type EventStream<P, C> = BoxStream<'static, ControllerEvent<P, C>>;

/// Configuration for the controller runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name used in logs.
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of concurrent reconciles.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Delay after the first failure of a key.
    #[serde(with = "ebb_core::duration::millis", default = "default_backoff_base")]
    pub backoff_base: Duration,
    /// Upper bound of the failure backoff.
    #[serde(with = "ebb_core::duration::secs", default = "default_backoff_max")]
    pub backoff_max: Duration,
    /// Capacity of the channel between the queue poller and the router.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: default_workers(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("controller.name", "must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::invalid_config("controller.workers", "must be at least 1"));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::invalid_config(
                "controller.event_channel_capacity",
                "must be at least 1",
            ));
        }
        if self.backoff_base.is_zero() {
            return Err(Error::invalid_config(
                "controller.backoff_base",
                "must be greater than zero",
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(Error::invalid_config(
                "controller.backoff_max",
                "must not be smaller than controller.backoff_base",
            ));
        }
        Ok(())
    }

    /// Backoff policy of the work queue.
    pub const fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base, self.backoff_max)
    }
}

fn default_name() -> String {
    "sqs".to_string()
}

const fn default_workers() -> usize {
    1
}

const fn default_backoff_base() -> Duration {
    DEFAULT_BASE_DELAY
}

const fn default_backoff_max() -> Duration {
    DEFAULT_MAX_DELAY
}

const fn default_event_channel_capacity() -> usize {
    1
}

/// Reconcile counters, shared between workers.
#[derive(Debug, Default)]
pub struct ReconcileStats {
    succeeded: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ReconcileStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub succeeded: u64,
    pub requeued: u64,
    pub failed: u64,
}

impl StatsSnapshot {
    /// Number of reconciles run.
    pub const fn total(&self) -> u64 {
        self.succeeded
            .saturating_add(self.requeued)
            .saturating_add(self.failed)
    }
}

impl ReconcileStats {
    fn record(&self, outcome: &ReconcileOutcome) {
        let counter = match outcome {
            ReconcileOutcome::Succeeded => &self.succeeded,
            ReconcileOutcome::Requeue(_) | ReconcileOutcome::RequeueImmediate => &self.requeued,
            ReconcileOutcome::Error(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Feeds mapped events into the work queue.
pub struct EventRouter<P, C> {
    queue: WorkQueue<ObjectKey>,
    watches: SelectAll<EventStream<P, C>>,
    channels: SelectAll<ReceiverStream<GenericEvent>>,
}

impl<P: Resource, C: Resource> EventRouter<P, C> {
    /// Merge the watch streams and the external channels into one router.
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        watches: Vec<EventStream<P, C>>,
        channels: Vec<mpsc::Receiver<GenericEvent>>,
    ) -> Self {
        Self {
            queue,
            watches: select_all(watches),
            channels: select_all(channels.into_iter().map(ReceiverStream::new)),
        }
    }

    /// Route events until shutdown or until every source has ended.
    ///
    /// Returns the number of work items added.
    pub async fn run(mut self, mut shutdown: ShutdownListener) -> u64 {
        let mut routed: u64 = 0;
        let mut watches_open = !self.watches.is_empty();
        let mut channels_open = !self.channels.is_empty();

        while watches_open || channels_open {
            tokio::select! {
                signal = shutdown.recv() => {
                    let drained = self.drain_channels().await;
                    routed = routed.saturating_add(drained);
                    info!(signal = %signal, routed, drained, "Event router stopping");
                    return routed;
                }
                event = self.watches.next(), if watches_open => match event {
                    Some(event) => routed = routed.saturating_add(Self::route(&self.queue, &event).await),
                    None => watches_open = false,
                },
                event = self.channels.next(), if channels_open => match event {
                    Some(event) => {
                        let event = ControllerEvent::External(event);
                        routed = routed.saturating_add(Self::route(&self.queue, &event).await);
                    }
                    None => channels_open = false,
                },
            }
        }

        info!(routed, "All event sources closed, event router stopping");
        routed
    }

    /// Close the external channels and route what they still buffer.
    async fn drain_channels(&mut self) -> u64 {
        for channel in self.channels.iter_mut() {
            channel.close();
        }

        let mut routed: u64 = 0;
        while let Some(event) = self.channels.next().await {
            routed = routed.saturating_add(Self::route(&self.queue, &ControllerEvent::External(event)).await);
        }
        routed
    }

    async fn route(queue: &WorkQueue<ObjectKey>, event: &ControllerEvent<P, C>) -> u64 {
        let keys = map_event(event);
        if keys.is_empty() {
            trace!(source = event.source(), "Event maps to no work item");
            return 0;
        }

        let (event_id, message_id) = match event {
            ControllerEvent::External(generic) => {
                (Some(generic.event_id), generic.message_id.as_deref())
            }
            ControllerEvent::Primary(_) | ControllerEvent::Owned(_) => (None, None),
        };

        let mut routed: u64 = 0;
        for key in keys {
            debug!(
                source = event.source(),
                key = %key,
                event_id = event_id.map(tracing::field::display),
                message_id,
                "Enqueueing work item"
            );
            queue.add(key).await;
            routed = routed.saturating_add(1);
        }
        routed
    }
}

/// Assembles a [`Controller`] from its event sources.
pub struct ControllerBuilder<P, C, R> {
    name: String,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    workers: usize,
    watches: Vec<EventStream<P, C>>,
    channels: Vec<mpsc::Receiver<GenericEvent>>,
}

impl<P: Resource, C: Resource, R: Reconcile> ControllerBuilder<P, C, R> {
    /// Start building a controller around `queue` and `reconciler`.
    pub fn new(name: impl Into<String>, queue: WorkQueue<ObjectKey>, reconciler: Arc<R>) -> Self {
        Self {
            name: name.into(),
            queue,
            reconciler,
            workers: default_workers(),
            watches: Vec::new(),
            channels: Vec::new(),
        }
    }

    /// Set the number of concurrent reconciles.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Watch the primary resource type.
    #[must_use]
    pub fn watches_primary<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = WatchEvent<P>> + Send + 'static,
    {
        self.watches.push(stream.map(ControllerEvent::Primary).boxed());
        self
    }

    /// Watch a resource type owned by the primary type.
    #[must_use]
    pub fn owns<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = WatchEvent<C>> + Send + 'static,
    {
        self.watches.push(stream.map(ControllerEvent::Owned).boxed());
        self
    }

    /// Consume externally injected events.
    ///
    /// Events still buffered in the channel when shutdown starts are routed
    /// before the queue drains.
    #[must_use]
    pub fn watches_channel(mut self, receiver: mpsc::Receiver<GenericEvent>) -> Self {
        self.channels.push(receiver);
        self
    }

    /// Build the controller.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoEventSources` if nothing feeds the controller, or a
    /// configuration error for zero workers.
    pub fn build(self) -> Result<Controller<P, C, R>> {
        if self.watches.is_empty() && self.channels.is_empty() {
            return Err(Error::NoEventSources { name: self.name });
        }
        if self.workers == 0 {
            return Err(Error::invalid_config("controller.workers", "must be at least 1"));
        }

        Ok(Controller {
            name: self.name,
            queue: self.queue,
            reconciler: self.reconciler,
            workers: self.workers,
            watches: self.watches,
            channels: self.channels,
            stats: Arc::new(ReconcileStats::default()),
        })
    }
}

/// A runnable controller.
pub struct Controller<P, C, R> {
    name: String,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    workers: usize,
    watches: Vec<EventStream<P, C>>,
    channels: Vec<mpsc::Receiver<GenericEvent>>,
    stats: Arc<ReconcileStats>,
}

impl<P: Resource, C: Resource, R: Reconcile> Controller<P, C, R> {
    /// Name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The work queue feeding the workers.
    pub const fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Shared reconcile counters.
    pub fn stats(&self) -> Arc<ReconcileStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown.
    ///
    /// On shutdown the router stops first, routing what the external
    /// channels still buffer. Then the queue drains: reconciles in flight
    /// finish and keys already queued are still processed.
    ///
    /// # Errors
    ///
    /// Returns `Error::TaskFailed` if a worker task panicked.
    pub async fn run(self, shutdown: ShutdownListener) -> Result<StatsSnapshot> {
        let Self {
            name,
            queue,
            reconciler,
            workers,
            watches,
            channels,
            stats,
        } = self;

        info!(
            controller = %name,
            workers,
            watches = watches.len(),
            channels = channels.len(),
            "Starting controller"
        );

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: queue.clone(),
                reconciler: Arc::clone(&reconciler),
                stats: Arc::clone(&stats),
            };
            tasks.spawn(
                worker
                    .run()
                    .instrument(info_span!("worker", controller = %name, worker = id)),
            );
        }

        EventRouter::new(queue.clone(), watches, channels)
            .run(shutdown)
            .instrument(info_span!("event_router", controller = %name))
            .await;

        queue.shutdown_with_drain().await;

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(controller = %name, error = %e, "Worker task failed");
                failure = Some(Error::task_failed(e.to_string()));
            }
        }

        let snapshot = stats.snapshot();
        info!(
            controller = %name,
            succeeded = snapshot.succeeded,
            requeued = snapshot.requeued,
            failed = snapshot.failed,
            "Controller stopped"
        );

        failure.map_or(Ok(snapshot), Err)
    }
}

struct Worker<R> {
    id: usize,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    stats: Arc<ReconcileStats>,
}

impl<R: Reconcile> Worker<R> {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            process(&self.queue, self.reconciler.as_ref(), &self.stats, key).await;
        }
        debug!(worker = self.id, "Worker stopped");
    }
}

/// Reconcile one claimed key and report the outcome to the queue.
///
/// The key is released with `done` whatever the reconcile did, panics
/// included.
async fn process<R: Reconcile + ?Sized>(
    queue: &WorkQueue<ObjectKey>,
    reconciler: &R,
    stats: &ReconcileStats,
    key: ObjectKey,
) {
    let result = match AssertUnwindSafe(reconciler.reconcile(&key))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(key = %key, panic = %reason, "Reconcile panicked");
            Err(Error::reconcile_failed(&key, format!("panicked: {reason}")))
        }
    };
    let outcome = ReconcileOutcome::from_result(result);
    stats.record(&outcome);
    debug!(key = %key, outcome = outcome.as_str(), "Reconcile finished");

    match &outcome {
        ReconcileOutcome::Succeeded => {
            queue.forget(&key).await;
        }
        ReconcileOutcome::Requeue(delay) => {
            queue.forget(&key).await;
            debug!(key = %key, delay_ms = delay.as_millis(), "Requeueing after delay");
            queue.add_after(key.clone(), *delay).await;
        }
        ReconcileOutcome::RequeueImmediate => {
            debug!(key = %key, "Requeueing immediately");
            queue.add(key.clone()).await;
        }
        ReconcileOutcome::Error(reason) => {
            let attempt = queue.num_requeues(&key).await.saturating_add(1);
            warn!(key = %key, attempt, error = %reason, "Reconcile failed, retrying with backoff");
            queue.add_rate_limited(key.clone()).await;
        }
    }

    queue.done(&key).await;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ControllerConfig::default();
        assert_eq!(config.name, "sqs");
        assert_eq!(config.workers, 1);
        assert_eq!(config.event_channel_capacity, 1);
        assert_eq!(config.backoff(), ExponentialBackoff::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let zero_workers = ControllerConfig {
            workers: 0,
            ..ControllerConfig::default()
        };
        assert!(zero_workers.validate().is_err());

        let inverted = ControllerConfig {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(1),
            ..ControllerConfig::default()
        };
        assert!(inverted.validate().is_err());

        let zero_capacity = ControllerConfig {
            event_channel_capacity: 0,
            ..ControllerConfig::default()
        };
        assert!(zero_capacity.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let config: std::result::Result<ControllerConfig, _> =
            toml::from_str("workers = 4\nbackoff_base = 100\nbackoff_max = 60\n");
        let config = config.ok();
        assert_eq!(config.as_ref().map(|c| c.workers), Some(4));
        assert_eq!(
            config.as_ref().map(|c| c.backoff_base),
            Some(Duration::from_millis(100))
        );
        assert_eq!(config.map(|c| c.name), Some("sqs".to_string()));
    }

    #[test]
    fn test_stats_record() {
        let stats = ReconcileStats::default();
        stats.record(&ReconcileOutcome::Succeeded);
        stats.record(&ReconcileOutcome::Requeue(Duration::from_secs(1)));
        stats.record(&ReconcileOutcome::RequeueImmediate);
        stats.record(&ReconcileOutcome::Error("boom".to_string()));

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                succeeded: 1,
                requeued: 2,
                failed: 1,
            }
        );
        assert_eq!(stats.snapshot().total(), 4);
    }

    #[test]
    fn test_panic_message_from_payload() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new("kaput".to_string());
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "kaput");
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }
}
