// ABOUTME: Bounded pool of Docker daemon connections with a non-blocking fast path
// ABOUTME: Owns the idle/in-use sets and enforces the connection ceiling

//! Connection pool.
//!
//! The pool keeps three counts under one mutex: idle connections, connections
//! checked out to callers, and *reserved* slots that are being created or
//! probed outside the lock. Their sum never exceeds `max_size`.
//!
//! ```text
//!            try_acquire()
//!                 │
//!      ┌──────────┴───────────┐
//!      │ lock: idle? / room?  │──── neither ───▶ Attempt::Exhausted
//!      └──────────┬───────────┘
//!        reserve slot, unlock
//!                 │
//!     idle ─▶ probe ──ok──▶ check out ─▶ Attempt::Acquired
//!                 │
//!               dead ─▶ evict, create replacement in the same slot
//!     room ─▶ create ───────▶ check out ─▶ Attempt::Acquired
//! ```
//!
//! No daemon I/O ever happens while the mutex is held. Reservations are
//! RAII guards, so a caller dropping `try_acquire` mid-probe cannot leak a
//! slot.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::connection::{ConnectError, Connection, ConnectionId, Connector};
use super::health;
use super::timeouts::OperationKind;

// === Broker Errors ===

/// Errors surfaced to callers of the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Daemon unreachable while opening a connection, fallback included
    #[error("Failed to create daemon connection: {0}")]
    ConnectionCreation(#[source] ConnectError),

    /// Idle connection was dead and its replacement could not be opened
    #[error("Liveness probe failed ({probe}) and replacement failed: {replacement}")]
    LivenessProbe {
        /// Why the idle connection was evicted
        probe: ConnectError,
        /// Why the replacement could not be created
        #[source]
        replacement: ConnectError,
    },

    /// Request sat in the acquisition queue past its deadline
    #[error("Waited {waited:?} for a daemon connection (queue deadline {deadline:?}); pool congested")]
    QueueTimeout {
        /// Time spent queued
        waited: Duration,
        /// Deadline that applied to this request
        deadline: Duration,
    },

    /// A connection was obtained but the daemon call itself ran too long
    #[error("Daemon did not complete {operation} call within {timeout:?}")]
    OperationTimeout {
        /// Kind of call that timed out
        operation: OperationKind,
        /// Per-operation timeout that applied
        timeout: Duration,
    },

    /// Broker was used before `start()`
    #[error("Broker is not running")]
    NotRunning,

    /// `start()` called twice
    #[error("Broker is already running")]
    AlreadyRunning,

    /// Broker shut down before the request could be served
    #[error("Broker shut down before the request was served")]
    Shutdown,

    /// The queue processor panicked while serving this request; the broker
    /// keeps running and later requests are unaffected
    #[error("Queue processor faulted while serving the request")]
    ProcessorFault,
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

// === Pool State ===

/// Outcome of a fast-path acquisition attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// A live connection was checked out
    Acquired(T),
    /// Ceiling reached with nothing idle; the caller should queue
    Exhausted,
}

/// Point-in-time counts of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Connections parked in the pool
    pub idle: usize,
    /// Connections owned by callers
    pub in_use: usize,
    /// Slots held while a connection is created or probed
    pub reserved: usize,
    /// Connection ceiling
    pub max_size: usize,
}

impl PoolSnapshot {
    /// Total slots currently counted against the ceiling
    pub const fn total(&self) -> usize {
        self.idle + self.in_use + self.reserved
    }
}

struct PoolState<T> {
    idle: VecDeque<Connection<T>>,
    in_use: HashSet<ConnectionId>,
    reserved: usize,
    closed: bool,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.reserved
    }
}

enum Slot<T> {
    Idle(Connection<T>),
    Fresh,
}

// === Connection Pool ===

/// Bounded pool of daemon connections
pub struct ConnectionPool<C: Connector> {
    connector: C,
    state: Mutex<PoolState<C::Client>>,
    max_size: usize,
    probe_timeout: Duration,
    available: Notify,
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("ConnectionPool")
            .field("idle", &snapshot.idle)
            .field("in_use", &snapshot.in_use)
            .field("reserved", &snapshot.reserved)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create an empty pool. Connections are opened lazily on demand.
    pub fn new(connector: C, max_size: usize, probe_timeout: Duration) -> Self {
        Self {
            connector,
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(max_size),
                in_use: HashSet::with_capacity(max_size),
                reserved: 0,
                closed: false,
            }),
            max_size: max_size.max(1),
            probe_timeout,
            available: Notify::new(),
        }
    }

    /// Connection ceiling
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// The connector used to open and probe connections
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    pub(crate) const fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Client>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current idle / in-use / reserved counts
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.lock_state();
        PoolSnapshot {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            reserved: state.reserved,
            max_size: self.max_size,
        }
    }

    /// Wait until a slot may have been freed.
    ///
    /// Wakeups are hints: the permit may be stale, so callers must re-check
    /// availability with [`Self::try_acquire`].
    pub async fn slot_freed(&self) {
        self.available.notified().await;
    }

    /// Fast path: check out a connection without waiting.
    ///
    /// Returns `Attempt::Exhausted` when the ceiling is reached and nothing is
    /// idle. That is a signal to queue, not an error.
    pub async fn try_acquire(self: &Arc<Self>) -> BrokerResult<Attempt<PooledConnection<C>>> {
        let (slot, reservation) = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(BrokerError::Shutdown);
            }

            let slot = if let Some(conn) = state.idle.pop_back() {
                Slot::Idle(conn)
            } else if state.total() < self.max_size {
                Slot::Fresh
            } else {
                return Ok(Attempt::Exhausted);
            };

            state.reserved += 1;
            (slot, Reservation::new(self, 1))
        };

        let conn = match slot {
            Slot::Idle(conn) => match health::probe(&self.connector, &conn, self.probe_timeout).await {
                Ok(()) => conn,
                Err(probe) => {
                    warn!(connection = %conn.id(), error = %probe, "Evicting dead idle connection");
                    drop(conn);
                    // The evicted connection's slot is reused for its replacement
                    self.create_connection().await.map_err(|replacement| {
                        BrokerError::LivenessProbe { probe, replacement }
                    })?
                }
            },
            Slot::Fresh => self
                .create_connection()
                .await
                .map_err(BrokerError::ConnectionCreation)?,
        };

        self.check_out(conn, reservation).map(Attempt::Acquired)
    }

    /// Open a connection, with one immediate fallback attempt.
    async fn create_connection(&self) -> Result<Connection<C::Client>, ConnectError> {
        match self.connector.connect().await {
            Ok(client) => Ok(Connection::new(client)),
            Err(first) => {
                warn!(error = %first, "Daemon connection attempt failed, retrying once");
                let client = self.connector.connect().await?;
                Ok(Connection::new(client))
            }
        }
    }

    fn check_out(
        self: &Arc<Self>,
        mut conn: Connection<C::Client>,
        mut reservation: Reservation<'_, C>,
    ) -> BrokerResult<PooledConnection<C>> {
        let mut state = self.lock_state();
        state.reserved -= 1;
        reservation.count = 0;

        if state.closed {
            drop(state);
            self.available.notify_one();
            return Err(BrokerError::Shutdown);
        }

        conn.mark_used();
        state.in_use.insert(conn.id());
        debug!(
            connection = %conn.id(),
            in_use = state.in_use.len(),
            idle = state.idle.len(),
            "Checked out daemon connection"
        );

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
        })
    }

    /// Return a checked-out connection to the idle set.
    ///
    /// A connection that is not currently checked out is dropped instead, so
    /// a stray second release can never put it in the pool twice.
    pub fn release(&self, mut conn: Connection<C::Client>) {
        {
            let mut state = self.lock_state();
            if !state.in_use.remove(&conn.id()) {
                warn!(connection = %conn.id(), "Ignoring release of connection that is not checked out");
                return;
            }

            if state.closed {
                debug!(connection = %conn.id(), "Pool closed, dropping released connection");
            } else {
                conn.mark_returned();
                state.idle.push_back(conn);
            }
        }
        self.available.notify_one();
    }

    /// Drop a checked-out connection the caller found broken.
    pub fn discard(&self, conn: Connection<C::Client>) {
        let removed = self.lock_state().in_use.remove(&conn.id());
        if removed {
            debug!(connection = %conn.id(), "Discarded broken daemon connection");
            self.available.notify_one();
        }
    }

    /// Move every idle connection out of the pool for probing.
    ///
    /// The connections stay counted against the ceiling through the returned
    /// reservation until [`Self::restore_probed`] runs.
    pub(crate) fn drain_idle(&self) -> (Vec<Connection<C::Client>>, Reservation<'_, C>) {
        let mut state = self.lock_state();
        let drained: Vec<_> = state.idle.drain(..).collect();
        state.reserved += drained.len();
        let count = drained.len();
        (drained, Reservation::new(self, count))
    }

    /// Put live connections back after a sweep; the rest of the reservation
    /// is released, freeing the slots of evicted connections.
    ///
    /// Waiters are woken whenever anything came back, since requests that
    /// arrived mid-sweep were queued against the drained idle set.
    pub(crate) fn restore_probed(
        &self,
        alive: Vec<Connection<C::Client>>,
        mut reservation: Reservation<'_, C>,
    ) {
        let returned = reservation.count;
        {
            let mut state = self.lock_state();
            state.reserved -= returned;
            reservation.count = 0;
            if !state.closed {
                state.idle.extend(alive);
            }
        }

        if returned > 0 {
            self.available.notify_one();
        }
    }

    /// Close the pool: drop idle connections and refuse new checkouts.
    ///
    /// Connections still in use are dropped when their owners release them.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock_state();
            state.closed = true;
            let dropped = state.idle.len();
            state.idle.clear();
            dropped
        };
        info!(dropped, "Connection pool closed");
        self.available.notify_waiters();
        self.available.notify_one();
        dropped
    }

    /// Whether [`Self::close`] has run
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }
}

// === Reservation Guard ===

/// Slots counted against the ceiling while I/O runs outside the lock.
///
/// Dropping the guard releases whatever is still reserved.
pub(crate) struct Reservation<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    count: usize,
}

impl<'a, C: Connector> Reservation<'a, C> {
    const fn new(pool: &'a ConnectionPool<C>, count: usize) -> Self {
        Self { pool, count }
    }
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.count == 0 {
            return;
        }
        self.pool.lock_state().reserved -= self.count;
        self.pool.available.notify_one();
    }
}

// === Scoped Connection ===

/// A checked-out connection, returned to the pool when dropped
pub struct PooledConnection<C: Connector> {
    conn: Option<Connection<C::Client>>,
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> PooledConnection<C> {
    fn inner(&self) -> &Connection<C::Client> {
        // Only `None` after `discard` consumed the guard
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }

    /// Id of the underlying connection
    pub fn id(&self) -> ConnectionId {
        self.inner().id()
    }

    /// Borrow the daemon client
    pub fn client(&self) -> &C::Client {
        self.inner().client()
    }

    /// Number of times the connection has been handed out, this time included
    pub fn use_count(&self) -> u64 {
        self.inner().use_count()
    }

    /// Drop the connection instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Client;

    fn deref(&self) -> &Self::Target {
        self.client()
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(Connection::id))
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
