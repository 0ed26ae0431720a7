// ABOUTME: Pool invariants under concurrency: ceiling, single ownership, release on every exit path

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dockpool::broker::{BrokerError, OperationKind};
use futures_util::future::join_all;

use super::fake_daemon::{started_broker, FakeDaemon};

const GENEROUS: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn test_connection_count_never_exceeds_ceiling() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 3).await;

    // Sample the pool while the load runs
    let done = Arc::new(AtomicBool::new(false));
    let peak_total = Arc::new(AtomicUsize::new(0));
    let sampler = tokio::spawn({
        let broker = Arc::clone(&broker);
        let done = Arc::clone(&done);
        let peak_total = Arc::clone(&peak_total);
        async move {
            while !done.load(Ordering::SeqCst) {
                let snapshot = broker.pool().snapshot();
                peak_total.fetch_max(snapshot.idle + snapshot.in_use, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    });

    let calls = (0..20).map(|_| {
        broker.run(OperationKind::List, None, |client| async move {
            client.call(Duration::from_millis(50)).await
        })
    });
    let results = join_all(calls).await;
    done.store(true, Ordering::SeqCst);
    sampler.await.unwrap();

    assert!(results.iter().all(Result::is_ok));
    assert!(daemon.peak_calls() <= 3, "peak calls {}", daemon.peak_calls());
    assert!(peak_total.load(Ordering::SeqCst) <= 3);
    // Lazily created up to the ceiling, then reused
    assert_eq!(daemon.connects(), 3);

    let stats = broker.get_stats();
    assert_eq!(stats.total_requests, 20);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.available + stats.in_use, 3);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_dropping_connection_releases_it_once() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 2).await;

    let conn = broker.acquire(OperationKind::Info, Some("web-1"), GENEROUS).await.unwrap();
    let id = conn.id();
    let snapshot = broker.pool().snapshot();
    assert_eq!((snapshot.idle, snapshot.in_use), (0, 1));

    drop(conn);
    let snapshot = broker.pool().snapshot();
    assert_eq!((snapshot.idle, snapshot.in_use), (1, 0));

    // The same connection comes back, handed out a second time
    let conn = broker.acquire(OperationKind::Info, Some("web-1"), GENEROUS).await.unwrap();
    assert_eq!(conn.id(), id);
    assert_eq!(conn.use_count(), 2);
    assert_eq!(daemon.connects(), 1);
}

#[tokio::test]
async fn test_panicking_caller_still_releases() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    let task = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move {
            let _conn = broker.acquire(OperationKind::Stats, None, GENEROUS).await.unwrap();
            panic!("caller failed while holding a connection");
        }
    });
    assert!(task.await.unwrap_err().is_panic());

    let snapshot = broker.pool().snapshot();
    assert_eq!((snapshot.idle, snapshot.in_use), (1, 0));

    // The only slot is usable again without waiting
    let conn = broker.acquire(OperationKind::Stats, None, GENEROUS).await.unwrap();
    assert_eq!(conn.use_count(), 2);
}

#[tokio::test]
async fn test_discarded_connection_frees_its_slot() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    let conn = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap();
    let id = conn.id();
    conn.discard();

    let snapshot = broker.pool().snapshot();
    assert_eq!(snapshot.total(), 0);

    let conn = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap();
    assert_ne!(conn.id(), id);
    assert_eq!(daemon.connects(), 2);
}

#[tokio::test]
async fn test_dead_idle_connection_is_recycled() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 2).await;

    let conn = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap();
    let (pool_id, client_id) = (conn.id(), conn.client().id());
    drop(conn);
    daemon.kill(client_id);

    let conn = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap();
    assert_ne!(conn.id(), pool_id);
    assert_eq!(daemon.connects(), 2);

    let snapshot = broker.pool().snapshot();
    assert_eq!((snapshot.idle, snapshot.in_use, snapshot.reserved), (0, 1, 0));
}

#[tokio::test]
async fn test_unreachable_daemon_surfaces_creation_error() {
    let daemon = FakeDaemon::new();
    daemon.set_unreachable(true);
    let broker = started_broker(&daemon, 2).await;

    let err = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionCreation(_)), "got {err:?}");

    // One fallback attempt, then the reserved slot is given back
    assert_eq!(daemon.connect_attempts(), 2);
    assert_eq!(broker.pool().snapshot().total(), 0);
    assert_eq!(broker.get_stats().total_requests, 1);
}

#[tokio::test]
async fn test_single_connect_failure_is_absorbed_by_fallback() {
    let daemon = FakeDaemon::new();
    daemon.fail_next_connects(1);
    let broker = started_broker(&daemon, 2).await;

    let conn = broker.acquire(OperationKind::List, None, GENEROUS).await;
    assert!(conn.is_ok());
    assert_eq!(daemon.connect_attempts(), 2);
}

#[tokio::test]
async fn test_probe_failure_surfaces_when_replacement_fails() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    let conn = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap();
    daemon.kill(conn.client().id());
    drop(conn);
    daemon.set_unreachable(true);

    let err = broker.acquire(OperationKind::Info, None, GENEROUS).await.unwrap_err();
    assert!(matches!(err, BrokerError::LivenessProbe { .. }), "got {err:?}");
    assert_eq!(broker.pool().snapshot().total(), 0);

    // Once the daemon is back the slot is available again
    daemon.set_unreachable(false);
    assert!(broker.acquire(OperationKind::Info, None, GENEROUS).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_queued_request_does_not_leak() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    let held = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap();

    // Caller gives up long before the queue deadline
    let gave_up = tokio::time::timeout(
        Duration::from_secs(1),
        broker.acquire(OperationKind::List, None, GENEROUS),
    )
    .await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.get_stats().queue_depth, 0);

    drop(held);
    let snapshot = broker.pool().snapshot();
    assert_eq!((snapshot.idle, snapshot.in_use), (1, 0));

    let conn = broker.acquire(OperationKind::List, None, GENEROUS).await.unwrap();
    assert_eq!(conn.use_count(), 2);
}
