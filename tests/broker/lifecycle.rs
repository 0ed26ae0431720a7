// ABOUTME: Explicit start/shutdown lifecycle of the broker and its idle sweep

use std::sync::Arc;
use std::time::Duration;

use dockpool::broker::{BrokerError, OperationKind, SweepReport};

use super::fake_daemon::{broker, started_broker, FakeDaemon};

const GENEROUS: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_acquire_before_start_is_rejected() {
    let daemon = FakeDaemon::new();
    let broker = broker(&daemon, 2);

    let err = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotRunning));
    assert_eq!(daemon.connect_attempts(), 0);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 2).await;

    assert!(broker.is_running());
    assert!(matches!(broker.start().await, Err(BrokerError::AlreadyRunning)));
}

#[tokio::test]
async fn test_shutdown_before_start_is_rejected() {
    let daemon = FakeDaemon::new();
    let broker = broker(&daemon, 2);

    assert!(matches!(broker.shutdown().await, Err(BrokerError::NotRunning)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_fails_queued_requests() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;
    let held = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap();

    let waiter = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.acquire(OperationKind::List, None, GENEROUS).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    broker.shutdown().await.unwrap();
    assert!(!broker.is_running());

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, BrokerError::Shutdown), "got {err:?}");

    // Connections returned after shutdown are closed, not pooled
    drop(held);
    assert_eq!(broker.pool().snapshot().total(), 0);

    let err = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotRunning));
}

#[tokio::test]
async fn test_broker_is_not_restartable() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    broker.shutdown().await.unwrap();
    assert!(matches!(broker.start().await, Err(BrokerError::Shutdown)));
    assert!(matches!(broker.shutdown().await, Err(BrokerError::NotRunning)));
}

#[tokio::test]
async fn test_sweep_now_evicts_dead_idle_connections() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 3).await;

    let first = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap();
    let second = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap();
    daemon.kill(second.client().id());
    drop(first);
    drop(second);

    let report = broker.sweep_now().await;
    assert_eq!(report, SweepReport { probed: 2, evicted: 1 });

    let stats = broker.get_stats();
    assert_eq!(stats.available, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_queued_during_sweep_is_served_promptly() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;
    drop(broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap());
    assert_eq!(broker.get_stats().available, 1);

    daemon.set_ping_latency(Duration::from_millis(500));
    let sweep = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.sweep_now().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The only connection is out for probing, so this request queues
    let started = tokio::time::Instant::now();
    let conn = broker
        .acquire(OperationKind::List, None, Duration::from_secs(5))
        .await
        .unwrap();
    let waited = started.elapsed();

    assert_eq!(sweep.await.unwrap(), SweepReport { probed: 1, evicted: 0 });
    // Sweep probe (~0.5s) plus the checkout probe (0.5s), nowhere near the 90s deadline
    assert!(waited < Duration::from_secs(2), "waited {waited:?}");
    assert_eq!(daemon.connects(), 1);
    assert_eq!(broker.get_stats().timeouts, 0);

    drop(conn);
    broker.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_periodic_sweep_runs_without_traffic() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 2).await;

    let conn = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap();
    daemon.kill(conn.client().id());
    drop(conn);
    assert_eq!(broker.get_stats().available, 1);

    // Default sweep interval is 60s
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(broker.get_stats().available, 0);

    broker.shutdown().await.unwrap();
}
