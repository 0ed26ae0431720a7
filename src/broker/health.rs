// ABOUTME: Liveness probing for pooled daemon connections
// ABOUTME: Background sweep that evicts dead idle connections between requests

//! Health checking for the connection pool.
//!
//! Two entry points:
//! - [`probe`] runs before an idle connection is handed to a caller.
//! - [`HealthMonitor`] sweeps all idle connections on an interval so a long
//!   quiet period does not leave a pool of stale connections behind.
//!
//! # Usage
//!
//! ```ignore
//! let mut monitor = HealthMonitor::new(Duration::from_secs(60));
//! monitor.start(Arc::clone(&pool));
//!
//! // Later, stop gracefully
//! monitor.stop().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::{ConnectError, Connection, Connector};
use super::pool::ConnectionPool;

/// Run one low-timeout liveness probe against a connection.
pub async fn probe<C: Connector>(
    connector: &C,
    conn: &Connection<C::Client>,
    timeout: Duration,
) -> Result<(), ConnectError> {
    let result = connector.ping(conn.client(), timeout).await;
    if let Err(e) = &result {
        debug!(connection = %conn.id(), error = %e, "Liveness probe failed");
    }
    result
}

// === Sweep Result ===

/// Result of a single sweep over the idle set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle connections probed
    pub probed: usize,
    /// Connections evicted because their probe failed
    pub evicted: usize,
}

impl SweepReport {
    /// Whether every probed connection was alive
    pub const fn is_healthy(&self) -> bool {
        self.evicted == 0
    }
}

/// Probe every idle connection once and evict the dead ones.
///
/// Idle connections are moved out of the pool while probing, so callers see
/// them as reserved rather than available for the duration.
pub async fn sweep_idle<C: Connector>(pool: &ConnectionPool<C>) -> SweepReport {
    let (idle, reservation) = pool.drain_idle();
    let probed = idle.len();
    let mut alive = Vec::with_capacity(probed);

    for conn in idle {
        match probe(pool.connector(), &conn, pool.probe_timeout()).await {
            Ok(()) => alive.push(conn),
            Err(e) => warn!(connection = %conn.id(), error = %e, "Evicting dead idle connection"),
        }
    }

    let report = SweepReport {
        probed,
        evicted: probed - alive.len(),
    };
    pool.restore_probed(alive, reservation);
    report
}

// === Health Monitor ===

/// Background sweeper for a connection pool.
pub struct HealthMonitor {
    /// Interval between sweeps.
    interval: Duration,

    /// Shutdown flag for graceful termination.
    shutdown: Arc<AtomicBool>,

    /// Wakes the loop early on shutdown.
    wake: Arc<Notify>,

    /// Handle to the background sweep task.
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Create a monitor that sweeps every `interval`.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Start the sweep task for `pool`.
    pub fn start<C: Connector>(&mut self, pool: Arc<ConnectionPool<C>>) {
        self.shutdown.store(false, Ordering::SeqCst);

        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            Self::sweep_loop(pool, interval, shutdown, wake).await;
        }));
        info!(interval_secs = self.interval.as_secs(), "Health monitor started");
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        info!("Health monitor stopped");
    }

    /// Check if the monitor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    async fn sweep_loop<C: Connector>(
        pool: Arc<ConnectionPool<C>>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) {
        debug!("Health sweep loop started");

        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = wake.notified() => {}
            }

            if shutdown.load(Ordering::SeqCst) || pool.is_closed() {
                debug!("Health sweep loop received shutdown signal");
                break;
            }

            let report = sweep_idle(&pool).await;
            if report.is_healthy() {
                debug!(probed = report.probed, "Idle connections healthy");
            } else {
                warn!(
                    probed = report.probed,
                    evicted = report.evicted,
                    "Evicted dead idle connections"
                );
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
