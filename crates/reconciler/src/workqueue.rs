//! Deduplicating, rate-limited work queue.
//!
//! Semantics follow the classic controller work queue:
//!
//! - a key is pending at most once, however often it is added
//! - a key handed out by [`WorkQueue::get`] is claimed by exactly one worker
//!   until [`WorkQueue::done`]; adding it meanwhile marks it dirty and it is
//!   queued again on `done`
//! - failures grow a per-key backoff that [`WorkQueue::forget`] resets
//! - a key waits on at most one delayed add; the earliest deadline wins

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::backoff::ExponentialBackoff;

/// Bounds every work queue key has to meet.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    /// Deadline of the one delayed add scheduled per key.
    waiting: HashMap<K, Instant>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            waiting: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    /// Wakes workers blocked in `get`.
    available: Notify,
    /// Wakes `shutdown_with_drain` when the processing set empties.
    drained: Notify,
    /// Cancels pending delayed adds.
    shutdown_tx: watch::Sender<bool>,
    backoff: ExponentialBackoff,
}

/// Cloneable handle to a shared work queue.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create an empty queue using `backoff` for rate-limited adds.
    pub fn new(backoff: ExponentialBackoff) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                available: Notify::new(),
                drained: Notify::new(),
                shutdown_tx,
                backoff,
            }),
        }
    }

    /// Mark `key` as needing processing.
    ///
    /// A no-op when the key is already pending or the queue is shutting
    /// down. A key currently being processed is queued again on `done`.
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            trace!(key = ?key, "Key already pending or queue shutting down");
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(key = ?key, "Key is being processed, marked dirty");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.available.notify_one();
    }

    /// Wait for the next key and claim it.
    ///
    /// Returns `None` once the queue is shutting down and nothing is left
    /// to hand out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release the claim on `key`.
    ///
    /// If the key was added again while it was processed it goes back into
    /// the queue now.
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);

        let requeue = state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
        }
        let drained = state.processing.is_empty();
        drop(state);

        if requeue {
            self.inner.available.notify_one();
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Add `key` once its backoff has elapsed, growing the backoff.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay).await;
    }

    /// Add `key` after `delay`.
    ///
    /// Delayed adds of the same key coalesce: if one is already scheduled to
    /// fire no later than `delay` from now this call is a no-op, otherwise
    /// the earlier deadline replaces it. Pending delayed adds are dropped
    /// when the queue shuts down.
    pub async fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key).await;
            return;
        }
        let Some(deadline) = Instant::now().checked_add(delay) else {
            debug!(key = ?key, "Delay out of range, not scheduling");
            return;
        };

        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return;
            }
            if state
                .waiting
                .get(&key)
                .is_some_and(|scheduled| *scheduled <= deadline)
            {
                trace!(key = ?key, "Earlier delayed add already scheduled");
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }

        debug!(key = ?key, delay_ms = delay.as_millis(), "Scheduling delayed add");

        let queue = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => queue.fire(key, deadline).await,
                () = async {
                    let _ = shutdown.wait_for(|down| *down).await;
                } => {}
            }
        });
    }

    /// Add `key` if the delayed add due at `deadline` is still the current one.
    async fn fire(&self, key: K, deadline: Instant) {
        {
            let mut state = self.inner.state.lock().await;
            if state.waiting.get(&key) != Some(&deadline) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key).await;
    }

    /// Reset the backoff of `key`.
    pub async fn forget(&self, key: &K) {
        self.inner.state.lock().await.failures.remove(key);
    }

    /// Number of rate-limited adds of `key` since it was last forgotten.
    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of keys waiting to be claimed.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Whether no key is waiting to be claimed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of keys with a delayed add scheduled.
    pub async fn waiting(&self) -> usize {
        self.inner.state.lock().await.waiting.len()
    }

    /// Number of keys currently claimed by workers.
    pub async fn processing(&self) -> usize {
        self.inner.state.lock().await.processing.len()
    }

    /// Whether `shutdown` was called.
    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }

    /// Stop accepting keys and wake every waiting worker.
    ///
    /// Keys already queued are still handed out; `get` returns `None` once
    /// they are gone.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            state.waiting.clear();
        }
        self.inner.shutdown_tx.send_replace(true);
        self.inner.available.notify_waiters();
        debug!("Work queue shutting down");
    }

    /// Shut down, then wait until every claimed key is `done`.
    pub async fn shutdown_with_drain(&self) {
        self.shutdown().await;

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.inner.state.lock().await.processing.is_empty() {
                debug!("Work queue drained");
                return;
            }
            drained.await;
        }
    }
}
