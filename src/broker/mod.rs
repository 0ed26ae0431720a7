// ABOUTME: Pooled, backpressure-aware broker for all Docker daemon access
//
// The daemon sits behind a local socket with a hard concurrency ceiling, so
// every caller goes through one DaemonBroker that bounds connections, queues
// excess requests, recycles dead connections and picks per-call timeouts.
//
// Key components:
// - pool: idle/in-use sets, connection ceiling, non-blocking fast path
// - queue: FIFO slow path with a single event-driven processor
// - health: pre-handout liveness probe and periodic idle sweep
// - timeouts: workload classification into per-operation timeouts
// - stats: counters and wait-time moving average
// - connection: Connector seam and the bollard-backed DockerConnector

//! # Lifecycle
//!
//! ```ignore
//! let broker = DaemonBroker::from_app_config(&AppConfig::load()?);
//! broker.start().await?;
//!
//! let containers = broker
//!     .run(OperationKind::List, None, |docker| async move {
//!         docker.list_containers::<String>(None).await
//!     })
//!     .await??;
//!
//! broker.shutdown().await?;
//! ```
//!
//! # Two timeouts
//!
//! A queued request may wait `max(90s, 3 × operation timeout)` for a
//! connection and fails with [`BrokerError::QueueTimeout`]; once connected
//! the daemon call itself is bounded by the operation timeout and fails with
//! [`BrokerError::OperationTimeout`]. The first means the pool is congested,
//! the second that the daemon is slow.

pub mod config;
pub mod connection;
pub mod health;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod timeouts;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// Re-exports for convenient access
pub use config::BrokerConfig;
pub use connection::{ConnectError, ConnectStrategy, Connection, ConnectionId, Connector, DockerConnector};
pub use health::{HealthMonitor, SweepReport};
pub use pool::{Attempt, BrokerError, BrokerResult, ConnectionPool, PoolSnapshot, PooledConnection};
pub use queue::AcquisitionQueue;
pub use stats::{BrokerStats, StatsRecorder};
pub use timeouts::{OperationKind, TimeoutPolicyEngine, TimeoutProfile, TimeoutSettings, TimeoutSource};

use crate::config::AppConfig;

struct Lifecycle {
    started: bool,
    monitor: HealthMonitor,
    processor: Option<JoinHandle<()>>,
}

/// Sole entry point to the Docker daemon
///
/// Construct once, call [`Self::start`], share by reference (or `Arc`) with
/// every collaborator, and call [`Self::shutdown`] on the way out.
pub struct DaemonBroker<C: Connector = DockerConnector> {
    config: BrokerConfig,
    pool: Arc<ConnectionPool<C>>,
    queue: Arc<AcquisitionQueue<C>>,
    stats: Arc<StatsRecorder>,
    policy: Arc<TimeoutPolicyEngine>,
    running: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl<C: Connector> std::fmt::Debug for DaemonBroker<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonBroker")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DaemonBroker<DockerConnector> {
    /// Build a broker for the local Docker daemon from process configuration
    pub fn from_app_config(config: &AppConfig) -> Self {
        let connector = DockerConnector::from_host(
            config.docker.host.as_deref(),
            Duration::from_secs(config.docker.timeout),
        );
        Self::new(
            config.broker.clone(),
            connector,
            TimeoutPolicyEngine::new(config.timeouts.clone()),
        )
    }
}

impl<C: Connector> DaemonBroker<C> {
    /// Create a stopped broker. Call [`Self::start`] before acquiring.
    pub fn new(config: BrokerConfig, connector: C, policy: TimeoutPolicyEngine) -> Self {
        let config = config.sanitized();
        let pool = Arc::new(ConnectionPool::new(
            connector,
            config.max_connections,
            config.probe_timeout,
        ));
        let stats = Arc::new(StatsRecorder::new());
        let queue = Arc::new(AcquisitionQueue::new(
            Arc::clone(&pool),
            Arc::clone(&stats),
            config.clone(),
        ));

        Self {
            lifecycle: Mutex::new(Lifecycle {
                started: false,
                monitor: HealthMonitor::new(config.health_check_interval),
                processor: None,
            }),
            config,
            pool,
            queue,
            stats,
            policy: Arc::new(policy),
            running: AtomicBool::new(false),
        }
    }

    /// Broker configuration after sanitizing
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Timeout policy used by [`Self::acquire_for`] and [`Self::run`]
    pub fn policy(&self) -> &TimeoutPolicyEngine {
        &self.policy
    }

    /// The underlying pool
    pub const fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Whether the broker is accepting requests
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the queue processor and the idle sweep.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` on a second call and `Shutdown` after
    /// [`Self::shutdown`]; a broker is not restartable.
    pub async fn start(&self) -> BrokerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Err(BrokerError::AlreadyRunning);
        }
        if self.pool.is_closed() {
            return Err(BrokerError::Shutdown);
        }

        lifecycle.processor = Some(self.queue.start());
        lifecycle.monitor.start(Arc::clone(&self.pool));
        lifecycle.started = true;
        self.running.store(true, Ordering::SeqCst);

        info!(
            max_connections = self.config.max_connections,
            sweep_interval_secs = self.config.health_check_interval.as_secs(),
            "Daemon broker started"
        );
        Ok(())
    }

    /// Stop the broker: fail queued requests, close the pool, stop tasks.
    ///
    /// Connections still held by callers are dropped when released.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.started {
            return Err(BrokerError::NotRunning);
        }

        self.running.store(false, Ordering::SeqCst);
        lifecycle.monitor.stop().await;

        let failed = self.queue.close();
        let dropped = self.pool.close();

        if let Some(handle) = lifecycle.processor.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Queue processor did not stop in time");
            }
        }
        lifecycle.started = false;

        info!(failed_requests = failed, dropped_connections = dropped, "Daemon broker shut down");
        Ok(())
    }

    /// Acquire a connection for one daemon call.
    ///
    /// Tries the fast path first; when the pool is saturated the request is
    /// queued and waits up to the queue deadline derived from `timeout`.
    /// The connection returns to the pool when the guard is dropped.
    pub async fn acquire(
        &self,
        operation: OperationKind,
        resource: Option<&str>,
        timeout: Duration,
    ) -> BrokerResult<PooledConnection<C>> {
        if !self.is_running() {
            return Err(BrokerError::NotRunning);
        }

        // Callers already queued keep their place
        if self.queue.depth() == 0 {
            match self.pool.try_acquire().await {
                Ok(Attempt::Acquired(conn)) => {
                    self.stats.record_fast_path();
                    debug!(
                        operation = %operation,
                        resource = resource.unwrap_or("-"),
                        connection = %conn.id(),
                        "Acquired connection on fast path"
                    );
                    return Ok(conn);
                }
                Ok(Attempt::Exhausted) => {}
                Err(e) => {
                    self.stats.record_error();
                    return Err(e);
                }
            }
        }

        debug!(
            operation = %operation,
            resource = resource.unwrap_or("-"),
            "Pool saturated, queueing request"
        );
        self.queue
            .enqueue(timeout)
            .await
            .unwrap_or(Err(BrokerError::Shutdown))
    }

    /// Acquire with the timeout chosen by the policy engine.
    ///
    /// Returns the connection together with the per-operation timeout the
    /// caller should apply to its daemon call.
    pub async fn acquire_for(
        &self,
        operation: OperationKind,
        resource: Option<&str>,
    ) -> BrokerResult<(PooledConnection<C>, Duration)> {
        let timeout = self.policy.timeout_for(operation, resource);
        let conn = self.acquire(operation, resource, timeout).await?;
        Ok((conn, timeout))
    }

    /// Acquire a connection and run one daemon call under its operation timeout.
    ///
    /// The call is not cancelled when the timeout fires: it runs to
    /// completion in the background and its connection is returned to the
    /// pool afterwards, while the caller gets `OperationTimeout` right away.
    pub async fn run<F, Fut, T>(
        &self,
        operation: OperationKind,
        resource: Option<&str>,
        call: F,
    ) -> BrokerResult<T>
    where
        C::Client: Clone,
        F: FnOnce(C::Client) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (conn, timeout) = self.acquire_for(operation, resource).await?;
        let client = conn.client().clone();

        let mut task = tokio::spawn(async move {
            let output = call(client).await;
            drop(conn);
            output
        });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                Err(BrokerError::Shutdown)
            }
            Err(_) => {
                warn!(
                    operation = %operation,
                    resource = resource.unwrap_or("-"),
                    timeout_ms = timeout.as_millis(),
                    "Daemon call exceeded operation timeout"
                );
                Err(BrokerError::OperationTimeout { operation, timeout })
            }
        }
    }

    /// Point-in-time statistics
    pub fn get_stats(&self) -> BrokerStats {
        self.stats.snapshot(self.pool.snapshot())
    }

    /// Run one idle sweep now instead of waiting for the interval
    pub async fn sweep_now(&self) -> SweepReport {
        health::sweep_idle(&self.pool).await
    }
}

impl<C: Connector> Drop for DaemonBroker<C> {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut();
        if let Some(handle) = lifecycle.processor.take() {
            handle.abort();
        }
    }
}
