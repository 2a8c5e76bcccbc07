//! Wires the queue poller and the controller together and runs them until
//! shutdown.
//!
//! The poller feeds external events into the controller through a bounded
//! channel. Both run as tasks in one `JoinSet`. A task that stops on its own
//! (a fatal poller error, a failed controller) triggers a programmatic
//! shutdown of the rest, and everything is joined within the shutdown window.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use ebb_core::{SHUTDOWN_TIMEOUT, ShutdownCoordinator, ShutdownSignal};
use ebb_events::{Namespace, Role};
use ebb_queue::{QueueClient, QueuePoller};
use ebb_reconciler::{
    ClusterApi, ControllerBuilder, NamespaceReconciler, StatsSnapshot, WorkQueue,
};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::BridgeConfig;

/// How a bridge task ended.
enum TaskExit {
    Poller(ebb_queue::Result<()>),
    Controller(ebb_reconciler::Result<StatsSnapshot>),
}

/// Everything the joined tasks reported.
#[derive(Default)]
struct Outcome {
    stats: Option<StatsSnapshot>,
    errors: Vec<String>,
}

impl Outcome {
    fn record(&mut self, joined: std::result::Result<TaskExit, JoinError>) {
        match joined {
            Ok(TaskExit::Poller(Ok(()))) => info!("Queue poller stopped"),
            Ok(TaskExit::Poller(Err(e))) => {
                error!(error = %e, "Queue poller failed");
                self.errors.push(format!("queue poller: {e}"));
            }
            Ok(TaskExit::Controller(Ok(stats))) => self.stats = Some(stats),
            Ok(TaskExit::Controller(Err(e))) => {
                error!(error = %e, "Controller failed");
                self.errors.push(format!("controller: {e}"));
            }
            Err(e) => {
                error!(error = %e, "Bridge task panicked");
                self.errors.push(format!("task failed: {e}"));
            }
        }
    }

    fn into_result(self) -> Result<StatsSnapshot> {
        if self.errors.is_empty() {
            Ok(self.stats.unwrap_or_default())
        } else {
            Err(anyhow!(self.errors.join("; ")))
        }
    }
}

/// The assembled bridge: a queue, a cluster and their configuration.
pub struct Bridge<C: ?Sized> {
    config: BridgeConfig,
    queue_client: Arc<dyn QueueClient>,
    cluster: Arc<C>,
}

impl<C: ClusterApi + ?Sized> Bridge<C> {
    /// Create a bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if the polling, controller or reconciler
    /// configuration is invalid. The queue URL is not checked here; it
    /// belongs to whoever built `queue_client`.
    pub fn new(
        config: BridgeConfig,
        queue_client: Arc<dyn QueueClient>,
        cluster: Arc<C>,
    ) -> Result<Self> {
        config.validate_runtime()?;
        Ok(Self {
            config,
            queue_client,
            cluster,
        })
    }

    /// Run until `coordinator` initiates shutdown or a task stops on its
    /// own, then drain.
    ///
    /// # Errors
    ///
    /// Returns an error if a task failed or the drain exceeded the shutdown
    /// window.
    pub async fn run(self, coordinator: Arc<ShutdownCoordinator>) -> Result<StatsSnapshot> {
        let Self {
            config,
            queue_client,
            cluster,
        } = self;

        let (events_tx, events_rx) = mpsc::channel(config.controller.event_channel_capacity);
        let poller = QueuePoller::new(queue_client, events_tx, config.queue.clone())?;
        let reconciler = Arc::new(NamespaceReconciler::new(
            Arc::clone(&cluster),
            config.reconciler.clone(),
        )?);
        let controller = ControllerBuilder::<Namespace, Role, _>::new(
            config.controller.name.clone(),
            WorkQueue::new(config.controller.backoff()),
            reconciler,
        )
        .workers(config.controller.workers)
        .watches_primary(cluster.watch_namespaces())
        .owns(cluster.watch_roles())
        .watches_channel(events_rx)
        .build()?;

        let mut tasks = JoinSet::new();
        let listener = coordinator.listener();
        tasks.spawn(
            async move { TaskExit::Poller(poller.run(listener).await) }
                .instrument(info_span!("queue_poller")),
        );
        let listener = coordinator.listener();
        tasks.spawn(async move { TaskExit::Controller(controller.run(listener).await) });

        info!(
            controller = %config.controller.name,
            workers = config.controller.workers,
            ack_policy = ?config.queue.ack_policy,
            "Bridge running"
        );

        let mut outcome = Outcome::default();
        let mut shutdown = coordinator.listener();
        tokio::select! {
            signal = shutdown.recv() => {
                info!(signal = %signal, "Shutdown requested");
            }
            Some(joined) = tasks.join_next() => {
                outcome.record(joined);
                if !coordinator.is_shutdown_initiated() {
                    warn!("A bridge task stopped early, shutting down");
                    coordinator.initiate_shutdown(ShutdownSignal::Programmatic).await;
                }
            }
        }

        let drained = coordinator
            .drain(SHUTDOWN_TIMEOUT, async {
                while let Some(joined) = tasks.join_next().await {
                    outcome.record(joined);
                }
            })
            .await;

        if let Err(e) = drained {
            tasks.abort_all();
            return Err(e.into());
        }
        outcome.into_result()
    }
}
