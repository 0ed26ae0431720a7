// ABOUTME: FIFO of pending connection requests served by one background processor
// ABOUTME: Slow path of the broker: event-driven waits bounded by a generous queue deadline

//! Acquisition queue.
//!
//! When the fast path declines, the request becomes a [`PendingRequest`] at
//! the tail of a FIFO. A single processor task pops the head and retries the
//! pool's acquisition logic, sleeping on the pool's "slot freed" signal in
//! between. Each request waits at most `max(floor, multiplier × timeout)`
//! (90s / 3× by default) before failing with a queue timeout.
//!
//! # Ordering
//!
//! One queue and one consumer give arrival-order service under normal load.
//! This is best effort, not a real-time guarantee: the wakeup is a shared
//! hint that is re-checked in a loop, and stale or spurious wakeups are
//! tolerated rather than tracked per waiter.
//!
//! # Fault isolation
//!
//! Serving one request runs under `catch_unwind`. A panic is logged, the
//! affected caller receives [`BrokerError::ProcessorFault`], and the loop
//! resumes after a short backoff.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::BrokerConfig;
use super::connection::Connector;
use super::pool::{Attempt, BrokerError, BrokerResult, ConnectionPool, PooledConnection};
use super::stats::StatsRecorder;

/// Stand-in deadline when `enqueued_at + deadline` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Where a queued request's outcome is delivered
pub type ResultSlot<C> = oneshot::Sender<BrokerResult<PooledConnection<C>>>;

/// A request waiting for a connection
pub struct PendingRequest<C: Connector> {
    /// Request id, for log correlation
    pub id: Uuid,
    /// When the request entered the queue
    pub enqueued_at: Instant,
    /// Per-operation timeout the caller will apply once served
    pub timeout: Duration,
    result_slot: ResultSlot<C>,
}

/// Counts a request as queued until it is resolved or the processor unwinds
struct DepthGuard<'a> {
    waiting: &'a AtomicUsize,
    stats: &'a StatsRecorder,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let depth = self.waiting.fetch_sub(1, Ordering::SeqCst) - 1;
        self.stats.set_queue_depth(depth);
    }
}

/// FIFO of pending requests and its processor
pub struct AcquisitionQueue<C: Connector> {
    pending: Mutex<VecDeque<PendingRequest<C>>>,
    /// Requests enqueued and not yet resolved, including the one in service
    waiting: AtomicUsize,
    arrived: Notify,
    pool: Arc<ConnectionPool<C>>,
    stats: Arc<StatsRecorder>,
    config: BrokerConfig,
    shutdown: AtomicBool,
}

impl<C: Connector> AcquisitionQueue<C> {
    pub fn new(pool: Arc<ConnectionPool<C>>, stats: Arc<StatsRecorder>, config: BrokerConfig) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            waiting: AtomicUsize::new(0),
            arrived: Notify::new(),
            pool,
            stats,
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<PendingRequest<C>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests waiting for a connection, including the one being served
    pub fn depth(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Append a request; its outcome arrives on the returned receiver.
    pub fn enqueue(
        &self,
        timeout: Duration,
    ) -> oneshot::Receiver<BrokerResult<PooledConnection<C>>> {
        let (result_slot, receiver) = oneshot::channel();

        if self.shutdown.load(Ordering::SeqCst) {
            let _ = result_slot.send(Err(BrokerError::Shutdown));
            return receiver;
        }

        let request = PendingRequest {
            id: Uuid::new_v4(),
            enqueued_at: Instant::now(),
            timeout,
            result_slot,
        };
        let id = request.id;

        // Counted before it becomes visible to the processor
        let depth = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock_pending().push_back(request);
        self.stats.record_enqueued(depth);
        self.arrived.notify_one();

        if self.shutdown.load(Ordering::SeqCst) {
            // Raced with close(); fail it here rather than strand it
            self.close();
        }

        debug!(request = %id, depth, timeout_ms = timeout.as_millis(), "Queued connection request");
        receiver
    }

    /// Spawn the processor task.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.shutdown.store(false, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.process().await })
    }

    /// Stop accepting requests and fail everything still queued.
    ///
    /// Returns the number of requests failed.
    pub fn close(&self) -> usize {
        self.shutdown.store(true, Ordering::SeqCst);

        let drained: Vec<_> = self.lock_pending().drain(..).collect();
        let failed = drained.len();
        for request in drained {
            let _depth = DepthGuard {
                waiting: &self.waiting,
                stats: &self.stats,
            };
            let _ = request.result_slot.send(Err(BrokerError::Shutdown));
        }

        self.arrived.notify_one();
        if failed > 0 {
            info!(failed, "Failed queued requests on shutdown");
        }
        failed
    }

    async fn process(self: Arc<Self>) {
        debug!("Queue processor started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let next = self.lock_pending().pop_front();
            let Some(mut request) = next else {
                self.arrived.notified().await;
                continue;
            };

            let served = AssertUnwindSafe(self.serve(&mut request)).catch_unwind().await;
            match served {
                // A caller that left after the outcome was decided drops the
                // connection here, which returns it to the pool.
                Ok(Some(result)) => {
                    let _ = request.result_slot.send(result);
                }
                Ok(None) => {}
                Err(_) => {
                    self.stats.record_error();
                    error!(request = %request.id, "Queue processor fault, resuming after backoff");
                    let _ = request.result_slot.send(Err(BrokerError::ProcessorFault));
                    tokio::time::sleep(self.config.processor_backoff).await;
                }
            }
        }

        debug!("Queue processor stopped");
    }

    /// Drive one request to a terminal state.
    ///
    /// Returns `None` when the caller gave up while queued.
    async fn serve(&self, request: &mut PendingRequest<C>) -> Option<BrokerResult<PooledConnection<C>>> {
        let depth = DepthGuard {
            waiting: &self.waiting,
            stats: &self.stats,
        };
        let deadline_len = self.config.queue_deadline(request.timeout);
        let deadline = request
            .enqueued_at
            .checked_add(deadline_len)
            .unwrap_or_else(|| request.enqueued_at + FAR_FUTURE);

        let outcome = loop {
            if request.result_slot.is_closed() {
                break None;
            }

            match self.pool.try_acquire().await {
                Ok(Attempt::Acquired(conn)) => break Some(Ok(conn)),
                Ok(Attempt::Exhausted) => {}
                Err(e) => break Some(Err(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                break Some(Err(BrokerError::QueueTimeout {
                    waited: now - request.enqueued_at,
                    deadline: deadline_len,
                }));
            }

            tokio::select! {
                () = self.pool.slot_freed() => {}
                () = tokio::time::sleep_until(deadline) => {}
                () = request.result_slot.closed() => {}
            }
        };

        let waited = request.enqueued_at.elapsed();
        match &outcome {
            None => debug!(request = %request.id, "Caller abandoned queued request"),
            Some(Ok(conn)) => {
                self.stats.record_fulfilled(waited);
                debug!(
                    request = %request.id,
                    connection = %conn.id(),
                    waited_ms = waited.as_millis(),
                    "Queued request fulfilled"
                );
            }
            Some(Err(BrokerError::QueueTimeout { deadline: limit, .. })) => {
                self.stats.record_timeout();
                warn!(
                    request = %request.id,
                    waited_ms = waited.as_millis(),
                    deadline_ms = limit.as_millis(),
                    "Queued request timed out"
                );
            }
            Some(Err(e)) => {
                self.stats.record_error();
                warn!(request = %request.id, error = %e, "Queued request failed");
            }
        }

        drop(depth);
        outcome
    }
}
