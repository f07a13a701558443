//! Concurrency tests for the WebSocket ConnectionRegistry.
//!
//! These verify that register/unregister/push races never deadlock,
//! panic, or leave dead connections behind.

use parley_server::api_ws::{ClientEvent, ConnectionRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;

fn status(message: &str) -> ClientEvent {
    ClientEvent::Status {
        message: message.to_string(),
    }
}

#[tokio::test]
async fn concurrent_register_unregister_no_deadlock() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handles = Vec::new();

    for _ in 0..100 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let (tx, _rx) = mpsc::channel(4);
            let id = registry.register(tx).await;
            registry.push(id, status("hello")).await;
            registry.unregister(id).await;
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn push_after_unregister_is_a_no_op() {
    let registry = ConnectionRegistry::new();
    let (tx, mut rx) = mpsc::channel(4);
    let id = registry.register(tx).await;

    registry.unregister(id).await;
    registry.push(id, status("late")).await;
    registry.unregister(id).await;

    assert!(!registry.is_live(id).await);
    assert!(rx.try_recv().is_err(), "no event may arrive after unregister");
}

#[tokio::test]
async fn dead_connections_are_removed_exactly_once() {
    let registry = Arc::new(ConnectionRegistry::new());
    let (tx, rx) = mpsc::channel(4);
    let id = registry.register(tx).await;
    drop(rx);

    // Many concurrent pushes race to detect the dead connection.
    let mut handles = Vec::new();
    for _ in 0..20 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry.push(id, status("race")).await;
        }));
    }
    for handle in handles {
        handle.await.expect("push should not panic");
    }
    assert!(!registry.is_live(id).await);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn slow_consumer_keeps_connection_but_drops_events() {
    let registry = ConnectionRegistry::new();
    let (tx, mut rx) = mpsc::channel(2);
    let id = registry.register(tx).await;

    for i in 0..10 {
        registry.push(id, status(&format!("event-{i}"))).await;
    }

    // The channel only buffered two; the connection itself stays live.
    assert!(registry.is_live(id).await);
    assert_eq!(rx.recv().await, Some(status("event-0")));
    assert_eq!(rx.recv().await, Some(status("event-1")));
}
