// ABOUTME: Counters and moving averages for broker observability
//
// Tracks:
// - Requests: total served, queue timeouts
// - Queue: current depth, historical maximum depth
// - Wait time: 80/20 weighted moving average of queued waits
//
// All writes happen after a request's outcome is decided and use lock-free
// atomics, so recording never delays an acquisition.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::pool::PoolSnapshot;

/// Weight kept from the previous average on each new sample
const WAIT_AVERAGE_DECAY: f64 = 0.8;

/// Broker-level counters
#[derive(Debug)]
pub struct StatsRecorder {
    total_requests: AtomicU64,
    timeouts: AtomicU64,
    queue_depth: AtomicUsize,
    max_queue_depth: AtomicUsize,
    /// Bits of an `f64`; `u64::MAX` until the first sample
    avg_wait_bits: AtomicU64,
}

impl StatsRecorder {
    pub const fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            max_queue_depth: AtomicUsize::new(0),
            avg_wait_bits: AtomicU64::new(u64::MAX),
        }
    }

    /// A request was served without queueing
    pub fn record_fast_path(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// A request entered the queue, which now holds `depth` requests
    pub fn record_enqueued(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    /// The queue now holds `depth` requests
    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// A queued request received a connection after waiting `wait`
    pub fn record_fulfilled(&self, wait: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let sample = wait.as_secs_f64();
        let _ = self
            .avg_wait_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                let next = if bits == u64::MAX {
                    sample
                } else {
                    f64::from_bits(bits).mul_add(WAIT_AVERAGE_DECAY, sample * (1.0 - WAIT_AVERAGE_DECAY))
                };
                Some(next.to_bits())
            });
    }

    /// A queued request hit its deadline
    pub fn record_timeout(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A request ended with a connection error
    pub fn record_error(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Moving average of queued wait time, in seconds
    pub fn avg_wait_seconds(&self) -> f64 {
        match self.avg_wait_bits.load(Ordering::Relaxed) {
            u64::MAX => 0.0,
            bits => f64::from_bits(bits),
        }
    }

    /// Combine the counters with pool counts into a snapshot
    pub fn snapshot(&self, pool: PoolSnapshot) -> BrokerStats {
        BrokerStats {
            available: pool.idle,
            in_use: pool.in_use,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            max_queue_depth_seen: self.max_queue_depth.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_wait_seconds: self.avg_wait_seconds(),
            max_connections: pool.max_size,
        }
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStats {
    /// Idle connections ready for reuse
    pub available: usize,
    /// Connections currently owned by callers
    pub in_use: usize,
    /// Requests waiting in the queue
    pub queue_depth: usize,
    /// Deepest the queue has been
    pub max_queue_depth_seen: usize,
    /// Requests that reached a terminal outcome
    pub total_requests: u64,
    /// Requests that timed out in the queue
    pub timeouts: u64,
    /// Weighted moving average of queue wait time
    pub avg_wait_seconds: f64,
    /// Connection ceiling
    pub max_connections: usize,
}

impl std::fmt::Display for BrokerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Connections:      {}/{} in use, {} idle", self.in_use, self.max_connections, self.available)?;
        writeln!(f, "Queue depth:      {} (max seen {})", self.queue_depth, self.max_queue_depth_seen)?;
        writeln!(f, "Total requests:   {}", self.total_requests)?;
        writeln!(f, "Queue timeouts:   {}", self.timeouts)?;
        write!(f, "Avg queue wait:   {:.3}s", self.avg_wait_seconds)
    }
}
