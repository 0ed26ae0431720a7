// ABOUTME: Slow path behavior: queued liveness, arrival order, and the two timeout layers

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dockpool::broker::{BrokerError, OperationKind};
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use super::fake_daemon::{started_broker, FakeDaemon};

const FIVE_SECONDS: Duration = Duration::from_secs(5);

/// Let spawned callers reach the queue
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_extra_caller_waits_for_release() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 2).await;

    let first = broker.acquire(OperationKind::List, None, FIVE_SECONDS).await.unwrap();
    let _second = broker.acquire(OperationKind::List, None, FIVE_SECONDS).await.unwrap();

    let waiter = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.acquire(OperationKind::List, None, FIVE_SECONDS).await }
    });
    settle().await;

    assert_eq!(broker.get_stats().queue_depth, 1);
    assert!(!waiter.is_finished());

    let freed = first.id();
    drop(first);

    let third = waiter.await.unwrap().unwrap();
    assert_eq!(third.id(), freed);
    assert_eq!(daemon.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_queued_requests_complete_in_arrival_order() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;
    let held = broker.acquire(OperationKind::List, None, FIVE_SECONDS).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut callers = Vec::new();
    for arrival in 0..5 {
        callers.push(tokio::spawn({
            let broker = Arc::clone(&broker);
            let order = Arc::clone(&order);
            async move {
                let conn = broker.acquire(OperationKind::List, None, FIVE_SECONDS).await?;
                order.lock().unwrap().push(arrival);
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(conn);
                Ok::<_, BrokerError>(())
            }
        }));
        // Distinct arrival times
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(broker.get_stats().queue_depth, 5);
    drop(held);

    for caller in callers {
        caller.await.unwrap().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    let stats = broker.get_stats();
    assert_eq!(stats.max_queue_depth_seen, 5);
    assert_eq!(stats.total_requests, 6);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_uses_ninety_second_floor() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;
    let _held = broker.acquire(OperationKind::List, None, FIVE_SECONDS).await.unwrap();

    let started = Instant::now();
    let err = broker
        .acquire(OperationKind::List, None, FIVE_SECONDS)
        .await
        .unwrap_err();
    let waited = started.elapsed();

    match err {
        BrokerError::QueueTimeout { deadline, .. } => assert_eq!(deadline, Duration::from_secs(90)),
        other => panic!("Expected queue timeout, got {other:?}"),
    }
    assert!(waited >= Duration::from_secs(90), "failed early after {waited:?}");
    assert!(waited < Duration::from_secs(91), "failed late after {waited:?}");

    let stats = broker.get_stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_scales_with_operation_timeout() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;
    let _held = broker.acquire(OperationKind::Stats, None, FIVE_SECONDS).await.unwrap();

    let started = Instant::now();
    let err = broker
        .acquire(OperationKind::Stats, Some("palworld"), Duration::from_secs(40))
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, BrokerError::QueueTimeout { .. }));
    assert!(waited >= Duration::from_secs(120));
    assert!(waited < Duration::from_secs(121));
}

#[tokio::test(start_paused = true)]
async fn test_three_callers_on_two_connections() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 2).await;

    // Both served by the fast path
    let first = broker.acquire(OperationKind::Info, None, FIVE_SECONDS).await.unwrap();
    let second = broker.acquire(OperationKind::Info, None, FIVE_SECONDS).await.unwrap();
    assert_eq!(broker.get_stats().queue_depth, 0);

    let third = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.acquire(OperationKind::Info, None, FIVE_SECONDS).await }
    });
    settle().await;
    assert_eq!(broker.get_stats().queue_depth, 1);

    let released_at = Instant::now();
    drop(first);
    let third = third.await.unwrap().unwrap();
    assert!(released_at.elapsed() < Duration::from_millis(1));

    drop(second);
    drop(third);

    let stats = broker.get_stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.available + stats.in_use, 2);
    assert_eq!(stats.max_queue_depth_seen, 1);
    assert_eq!(stats.max_connections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_daemon_call_is_an_operation_timeout() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    // Web servers get a 5s info timeout
    let err = broker
        .run(OperationKind::Info, Some("nginx-edge"), |client| async move {
            client.call(Duration::from_secs(30)).await
        })
        .await
        .unwrap_err();

    match &err {
        BrokerError::OperationTimeout { operation, timeout } => {
            assert_eq!(*operation, OperationKind::Info);
            assert_eq!(*timeout, Duration::from_secs(5));
        }
        other => panic!("Expected operation timeout, got {other:?}"),
    }
    assert!(err.to_string().contains("Daemon did not complete info call"));
    assert_eq!(broker.get_stats().timeouts, 0);

    // The call keeps its connection until it finishes
    assert_eq!(broker.pool().snapshot().in_use, 1);
    tokio::time::sleep(Duration::from_secs(30)).await;
    let snapshot = broker.pool().snapshot();
    assert_eq!((snapshot.idle, snapshot.in_use), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn test_run_returns_daemon_output() {
    let daemon = FakeDaemon::new();
    let broker = started_broker(&daemon, 1).await;

    let client_id = broker
        .run(OperationKind::List, None, |client| async move {
            client.call(Duration::from_millis(200)).await
        })
        .await
        .unwrap();

    assert_eq!(client_id, 1);
    assert_eq!(broker.pool().snapshot().idle, 1);
}
