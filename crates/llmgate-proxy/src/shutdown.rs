//! Graceful shutdown coordination.
//!
//! A single [`CancellationToken`] fans out to the HTTP server and the
//! background loops (monitor tick, resource sweeper). In-flight work holds
//! a [`TaskGuard`]; after the signal fires we wait up to the configured
//! timeout for guards to drain, then exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown across the proxy's subsystems.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    timeout_seconds: u64,
}

impl ShutdownCoordinator {
    pub fn new(timeout_seconds: u64) -> Self {
        Self {
            token: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            timeout_seconds,
        }
    }

    /// Get a clone of the cancellation token (cheap).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register in-flight work; the counter drops with the guard.
    pub fn track_task(&self) -> TaskGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Trigger the shutdown signal programmatically.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for guards to drain, up to the configured timeout.
    ///
    /// Returns `false` if the timeout expired with work still pending.
    pub async fn wait_for_tasks(&self) -> bool {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(self.timeout_seconds);
        let poll = std::time::Duration::from_millis(250);

        loop {
            let count = self.in_flight_count();
            if count == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = count,
                    timeout_seconds = self.timeout_seconds,
                    "Shutdown timeout expired with tasks still pending"
                );
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// RAII guard that decrements the in-flight counter on drop.
pub struct TaskGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Resolves when a shutdown signal arrives, then cancels the token.
///
/// On Unix this listens for both SIGTERM and SIGINT.
pub async fn shutdown_signal(coordinator: ShutdownCoordinator) {
    let token = coordinator.token();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Shutdown signal received (SIGTERM)"),
            _ = sigint.recv() => info!("Shutdown signal received (SIGINT)"),
            _ = token.cancelled() => info!("Shutdown requested programmatically"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received (Ctrl-C)"),
            _ = token.cancelled() => info!("Shutdown requested programmatically"),
        }
    }

    coordinator.trigger();
}
