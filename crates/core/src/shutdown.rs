//! Graceful shutdown handling.
//!
//! Handles SIGTERM/SIGINT signals and coordinates the shutdown of the
//! background tasks: the queue poller and the event router stop selecting on
//! new work, the work queue drains, and the root joins every task within a
//! 30-second window.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Maximum time allowed for graceful shutdown (30 seconds)
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested (fatal task error, tests)
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Shutdown coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Normal operation, no shutdown initiated
    Running,
    /// Shutdown signal received, loops are leaving their select points
    Initiating,
    /// Waiting for in-flight work and background tasks
    Draining,
    /// Cleanup complete
    Complete,
}

/// Shutdown coordinator for graceful process shutdown.
///
/// The signal is held in a watch channel, so listeners created after the
/// shutdown was initiated still observe it.
pub struct ShutdownCoordinator {
    /// Current shutdown phase
    phase: Arc<RwLock<ShutdownPhase>>,
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Latest shutdown signal, `None` while running
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);

        Self {
            phase: Arc::new(RwLock::new(ShutdownPhase::Running)),
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            signal_tx,
        }
    }

    /// Get the current shutdown phase
    pub async fn phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Create a listener handed to a background task.
    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.signal_tx.subscribe(),
        }
    }

    /// Initiate graceful shutdown.
    ///
    /// Returns `false` when a shutdown was already in progress.
    pub async fn initiate_shutdown(&self, signal: ShutdownSignal) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Shutdown already in progress, ignoring duplicate signal");
            return false;
        }

        info!(signal = %signal, "Initiating graceful shutdown");
        *self.phase.write().await = ShutdownPhase::Initiating;

        info!(
            listeners = self.signal_tx.receiver_count(),
            "Broadcasting shutdown signal to listeners"
        );
        self.signal_tx.send_replace(Some(signal));
        true
    }

    /// Run the drain future within the shutdown window.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutdownTimeout` if `drain` does not finish within
    /// `limit`.
    pub async fn drain<F>(&self, limit: Duration, drain: F) -> Result<F::Output>
    where
        F: Future,
    {
        *self.phase.write().await = ShutdownPhase::Draining;

        match timeout(limit, drain).await {
            Ok(output) => {
                *self.phase.write().await = ShutdownPhase::Complete;
                info!("Graceful shutdown complete");
                Ok(output)
            }
            Err(_) => {
                error!(
                    timeout_secs = limit.as_secs(),
                    "Shutdown timeout exceeded, forcing exit"
                );
                Err(Error::ShutdownTimeout {
                    timeout_secs: limit.as_secs(),
                })
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownListener {
    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Wait until shutdown is requested.
    ///
    /// A dropped coordinator counts as a programmatic shutdown.
    pub async fn recv(&mut self) -> ShutdownSignal {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Programmatic),
            Err(_) => {
                debug!("Shutdown coordinator dropped");
                ShutdownSignal::Programmatic
            }
        }
    }
}

/// Install OS signal handlers (SIGTERM, SIGINT)
pub fn install_signal_handlers(
    coordinator: Arc<ShutdownCoordinator>,
) -> tokio::task::JoinHandle<()> {
    info!("Installing OS signal handlers");

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    coordinator.initiate_shutdown(ShutdownSignal::Sigterm).await;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    coordinator.initiate_shutdown(ShutdownSignal::Sigint).await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            // Windows doesn't have SIGTERM, only SIGINT (Ctrl+C)
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }

            info!("Received Ctrl+C");
            coordinator.initiate_shutdown(ShutdownSignal::Sigint).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_coordinator_creation() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.phase().await, ShutdownPhase::Running);
        assert!(!coordinator.is_shutdown_initiated());
        assert!(!coordinator.listener().is_shutdown());
    }

    #[tokio::test]
    async fn test_initiate_shutdown() {
        let coordinator = ShutdownCoordinator::new();

        assert!(
            coordinator
                .initiate_shutdown(ShutdownSignal::Programmatic)
                .await
        );
        assert!(coordinator.is_shutdown_initiated());
        assert_eq!(coordinator.phase().await, ShutdownPhase::Initiating);
    }

    #[tokio::test]
    async fn test_duplicate_shutdown_ignored() {
        let coordinator = ShutdownCoordinator::new();
        coordinator
            .initiate_shutdown(ShutdownSignal::Programmatic)
            .await;

        assert!(!coordinator.initiate_shutdown(ShutdownSignal::Sigterm).await);

        let mut listener = coordinator.listener();
        assert_eq!(listener.recv().await, ShutdownSignal::Programmatic);
    }

    #[tokio::test]
    async fn test_listener_created_before_signal_wakes() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let mut listener = coordinator.listener();

        let waiter = tokio::spawn(async move { listener.recv().await });
        coordinator.initiate_shutdown(ShutdownSignal::Sigint).await;

        let signal = waiter.await;
        assert_eq!(signal.ok(), Some(ShutdownSignal::Sigint));
    }

    #[tokio::test]
    async fn test_late_listener_observes_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.initiate_shutdown(ShutdownSignal::Sigterm).await;

        let mut late = coordinator.listener();
        assert!(late.is_shutdown());
        assert_eq!(late.recv().await, ShutdownSignal::Sigterm);
    }

    #[tokio::test]
    async fn test_dropped_coordinator_counts_as_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.listener();
        drop(coordinator);

        assert_eq!(listener.recv().await, ShutdownSignal::Programmatic);
    }

    #[tokio::test]
    async fn test_drain_completes() {
        let coordinator = ShutdownCoordinator::new();
        coordinator
            .initiate_shutdown(ShutdownSignal::Programmatic)
            .await;

        let output = coordinator
            .drain(Duration::from_secs(1), async { 7 })
            .await;

        assert_eq!(output.ok(), Some(7));
        assert_eq!(coordinator.phase().await, ShutdownPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let coordinator = ShutdownCoordinator::new();

        let output = coordinator
            .drain(Duration::from_secs(2), std::future::pending::<()>())
            .await;

        assert!(matches!(
            output,
            Err(Error::ShutdownTimeout { timeout_secs: 2 })
        ));
        assert_eq!(coordinator.phase().await, ShutdownPhase::Draining);
    }

    #[test]
    fn test_shutdown_signal_display() {
        assert_eq!(format!("{}", ShutdownSignal::Sigterm), "SIGTERM");
        assert_eq!(format!("{}", ShutdownSignal::Sigint), "SIGINT");
        assert_eq!(format!("{}", ShutdownSignal::Programmatic), "PROGRAMMATIC");
    }
}
