//! Coordination client behavior under ensemble failures.
//!
//! Every test runs against an in-process `MemoryEnsemble`, stopping and restarting
//! servers while operations are in flight.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test --test coordination_client_tests
//! cargo test --test coordination_client_tests reconnect
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::oneshot;
use tokio::time::sleep;

use zkdiscovery::coordination::{
    ConnectionLostHook, CoordinationClient, CoordinationError, CreateMode, MemoryEnsemble,
    SessionState,
};
use zkdiscovery::telemetry::init_test_logging;

// ============================================================================
// Test Infrastructure
// ============================================================================

const SESSION_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Hook that completes `rx` when the client reports the session lost for good.
fn lost_signal() -> (ConnectionLostHook, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let hook: ConnectionLostHook = Box::new(move || {
        let _ = tx.send(());
    });
    (hook, rx)
}

fn client_with_hook(
    ensemble: &MemoryEnsemble,
    connect_string: String,
) -> (CoordinationClient, oneshot::Receiver<()>) {
    let (hook, rx) = lost_signal();
    let client = CoordinationClient::new(
        ensemble.connector(),
        connect_string,
        SESSION_TIMEOUT,
        Some(hook),
    );
    (client, rx)
}

async fn connected_client(ensemble: &MemoryEnsemble) -> (CoordinationClient, oneshot::Receiver<()>) {
    let (client, rx) = client_with_hook(ensemble, ensemble.connect_string());
    client.await_connected().await.expect("client should connect");
    (client, rx)
}

async fn assert_lost_within(rx: oneshot::Receiver<()>, timeout: Duration) {
    tokio::time::timeout(timeout, rx)
        .await
        .expect("connection-lost hook should fire")
        .expect("hook sender dropped without firing");
}

// ============================================================================
// Connection Loss
// ============================================================================

#[tokio::test]
async fn test_connection_loss_unreachable_ensemble() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(1);
    let (client, lost) = client_with_hook(&ensemble, "127.0.0.1:1".to_string());

    assert_lost_within(lost, SESSION_TIMEOUT * 3).await;
    assert_eq!(client.state(), SessionState::Disconnected);

    let err = client
        .create_if_needed("/zk", Bytes::new(), CreateMode::Persistent)
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoordinationError::ConnectionFailed(_)),
        "unexpected error: {:?}",
        err
    );
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_connection_loss_all_servers_stopped() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(1);
    let (client, lost) = connected_client(&ensemble).await;
    client
        .create_if_needed("/zk", Bytes::new(), CreateMode::Persistent)
        .await
        .unwrap();

    ensemble.stop_all();

    let err = client.exists("/zk", None).await.unwrap_err();
    assert!(
        err.is_timed_out() || err.is_session_expired(),
        "unexpected error: {:?}",
        err
    );

    assert_lost_within(lost, SESSION_TIMEOUT * 3).await;
    assert_eq!(client.state(), SessionState::Expired);

    // Terminal: a restarted ensemble does not bring the client back.
    ensemble.start_all();
    let err = client.exists("/zk", None).await.unwrap_err();
    assert_eq!(err, CoordinationError::SessionExpired);
}

#[tokio::test]
async fn test_connection_loss_pending_async_call_never_succeeds() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(1);
    let (client, lost) = connected_client(&ensemble).await;

    ensemble.stop_server(0);

    let (tx, rx) = oneshot::channel();
    client.get_children_async("/", None, move |result| async move {
        let _ = tx.send(result);
    });

    let result = tokio::time::timeout(SESSION_TIMEOUT * 3, rx)
        .await
        .expect("callback should run")
        .expect("callback dropped");
    assert!(result.is_err(), "children listed without a server: {:?}", result);

    assert_lost_within(lost, SESSION_TIMEOUT * 3).await;
}

#[tokio::test]
async fn test_close_does_not_fire_connection_lost() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(1);
    let (client, mut lost) = connected_client(&ensemble).await;

    client.close().await;
    assert_eq!(client.state(), SessionState::Closed);
    sleep(SESSION_TIMEOUT + Duration::from_millis(200)).await;
    assert!(lost.try_recv().is_err());
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_reconnect_single_server_restarted_within_timeout() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(1);
    let (client, _lost) = connected_client(&ensemble).await;
    let session = client.session_id();

    ensemble.stop_server(0);

    let restarter = {
        let ensemble = ensemble.clone();
        tokio::spawn(async move {
            sleep(SESSION_TIMEOUT / 4).await;
            ensemble.start_server(0);
        })
    };

    let path = client
        .create_if_needed("/reconnect", Bytes::from_static(b"v"), CreateMode::Persistent)
        .await
        .expect("operation should survive a short outage");
    assert_eq!(path, "/reconnect");
    restarter.await.unwrap();

    assert_eq!(client.state(), SessionState::Connected);
    assert_eq!(client.session_id(), session);
}

#[tokio::test]
async fn test_reconnect_repeated_restarts_keep_session() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(1);
    let (client, _lost) = connected_client(&ensemble).await;
    let session = client.session_id();
    client
        .create("/marker", Bytes::new(), CreateMode::Ephemeral)
        .await
        .unwrap();

    for _ in 0..3 {
        ensemble.restart_server(0);
        let stat = client.exists("/marker", None).await.unwrap();
        assert!(stat.is_some(), "ephemeral lost across a restart");
    }

    assert_eq!(client.session_id(), session);
    assert!(ensemble.node_exists("/marker"));
}

#[tokio::test]
async fn test_reconnect_random_restarts_of_three_servers() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(3);
    let (client, mut lost) = connected_client(&ensemble).await;
    client
        .create_if_needed("/reconnect3", Bytes::new(), CreateMode::Persistent)
        .await
        .unwrap();

    let mut rng = StdRng::seed_from_u64(3);
    for i in 0..10 {
        let idx = rng.gen_range(0..3);
        ensemble.restart_server(idx);
        client
            .create(
                &format!("/reconnect3/n{}", i),
                Bytes::new(),
                CreateMode::Persistent,
            )
            .await
            .unwrap();
    }

    assert_eq!(ensemble.children("/reconnect3").len(), 10);
    assert!(lost.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_after_quorum_restored() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(3);
    let (client, _lost) = client_with_hook(&ensemble, ensemble.server_connect_string(2));
    client.await_connected().await.unwrap();

    ensemble.stop_server(0);
    ensemble.stop_server(1);
    assert!(!ensemble.has_quorum());

    let restarter = {
        let ensemble = ensemble.clone();
        tokio::spawn(async move {
            sleep(SESSION_TIMEOUT / 4).await;
            ensemble.start_server(0);
        })
    };

    client
        .create_if_needed("/quorum", Bytes::new(), CreateMode::Persistent)
        .await
        .expect("operation should complete once quorum returns");
    restarter.await.unwrap();
    assert_eq!(client.state(), SessionState::Connected);
}

// ============================================================================
// Fuzz
// ============================================================================

#[tokio::test]
async fn test_sequential_creates_survive_random_restarts() {
    init_test_logging();
    let ensemble = MemoryEnsemble::new(3);
    let (client, _lost) = connected_client(&ensemble).await;
    client
        .create_if_needed("/fuzz", Bytes::new(), CreateMode::Persistent)
        .await
        .unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let restarts = Arc::new(AtomicUsize::new(0));
    let chaos = {
        let ensemble = ensemble.clone();
        let running = Arc::clone(&running);
        let restarts = Arc::clone(&restarts);
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(42);
            while running.load(Ordering::SeqCst) {
                let idx = rng.gen_range(0..3);
                ensemble.stop_server(idx);
                sleep(Duration::from_millis(rng.gen_range(5..50))).await;
                ensemble.start_server(idx);
                restarts.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(rng.gen_range(5..50))).await;
            }
        })
    };

    let mut created = Vec::new();
    for _ in 0..50 {
        let path = client
            .create("/fuzz/n-", Bytes::new(), CreateMode::PersistentSequential)
            .await
            .expect("create should complete while a quorum stays up");
        created.push(path);
        sleep(Duration::from_millis(10)).await;
    }

    running.store(false, Ordering::SeqCst);
    chaos.await.unwrap();

    let unique: HashSet<_> = created.iter().collect();
    assert_eq!(unique.len(), created.len(), "duplicate sequence assigned");
    assert_eq!(ensemble.children("/fuzz").len(), created.len());
    assert!(restarts.load(Ordering::SeqCst) > 0);
}
