// ABOUTME: In-memory stand-in for the Docker daemon used by broker integration tests
//
// Provides:
// - FakeDaemon: Connector with scriptable connect failures and dead clients
// - FakeClient: cloneable client whose calls record daemon-side concurrency
// - started_broker(): a running DaemonBroker wired to a FakeDaemon

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dockpool::broker::{
    BrokerConfig, ConnectError, Connector, DaemonBroker, TimeoutPolicyEngine,
};

#[derive(Default)]
struct DaemonState {
    next_client: AtomicU64,
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    unreachable: AtomicBool,
    dead: Mutex<HashSet<u64>>,
    active_calls: AtomicUsize,
    peak_calls: AtomicUsize,
    ping_latency_ms: AtomicU64,
}

/// Scriptable fake daemon; clones share state
#[derive(Clone, Default)]
pub struct FakeDaemon {
    state: Arc<DaemonState>,
}

impl FakeDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful connections opened so far
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connection attempts, failed ones included
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Refuse every connection attempt until reset
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every liveness probe on `client` fail from now on
    pub fn kill(&self, client: u64) {
        self.state.dead.lock().unwrap().insert(client);
    }

    /// Make every liveness probe take `latency` before answering
    pub fn set_ping_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.ping_latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Most daemon calls ever in flight at once
    pub fn peak_calls(&self) -> usize {
        self.state.peak_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Connector for FakeDaemon {
    type Client = FakeClient;

    async fn connect(&self) -> Result<FakeClient, ConnectError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        // Opening a socket is never instantaneous
        tokio::task::yield_now().await;

        if self.state.unreachable.load(Ordering::SeqCst) || self.take_failure() {
            return Err(ConnectError::Unreachable("fake daemon refused connection".to_string()));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeClient {
            id: self.state.next_client.fetch_add(1, Ordering::SeqCst) + 1,
            state: Arc::clone(&self.state),
        })
    }

    async fn ping(&self, client: &FakeClient, _timeout: Duration) -> Result<(), ConnectError> {
        let latency = self.state.ping_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.state.dead.lock().unwrap().contains(&client.id) {
            return Err(ConnectError::Unreachable(format!("client {} is dead", client.id)));
        }
        Ok(())
    }
}

/// Handle to one fake daemon connection
#[derive(Clone)]
pub struct FakeClient {
    id: u64,
    state: Arc<DaemonState>,
}

impl FakeClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate a daemon call that takes `latency`
    pub async fn call(&self, latency: Duration) -> u64 {
        let active = self.state.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_calls.fetch_max(active, Ordering::SeqCst);

        tokio::time::sleep(latency).await;

        self.state.active_calls.fetch_sub(1, Ordering::SeqCst);
        self.id
    }
}

/// Broker over `daemon` with `max_connections` and built-in timeout rules
pub fn broker(daemon: &FakeDaemon, max_connections: usize) -> Arc<DaemonBroker<FakeDaemon>> {
    broker_with_policy(daemon, max_connections, TimeoutPolicyEngine::builtin_only())
}

pub fn broker_with_policy(
    daemon: &FakeDaemon,
    max_connections: usize,
    policy: TimeoutPolicyEngine,
) -> Arc<DaemonBroker<FakeDaemon>> {
    let config = BrokerConfig {
        max_connections,
        ..BrokerConfig::default()
    };
    Arc::new(DaemonBroker::new(config, daemon.clone(), policy))
}

/// Running broker over `daemon`
pub async fn started_broker(daemon: &FakeDaemon, max_connections: usize) -> Arc<DaemonBroker<FakeDaemon>> {
    let broker = broker(daemon, max_connections);
    broker.start().await.unwrap();
    broker
}
