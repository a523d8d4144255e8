//! Integration tests for endpoint supervision and link bookkeeping.

mod common;

use std::time::Duration;

use common::{init_test_tracing, pump_until};
use nowhile_core::config::ConnectionConfig;
use nowhile_core::connection::{ConnectionManager, ConnectionState, ManagerEvent};
use nowhile_core::error::Error;
use nowhile_core::identity::PeerId;
use nowhile_core::transport::memory::{MemoryNetwork, MemoryTransport};
use nowhile_core::transport::TransportError;
use tokio::time::Instant;

fn manager(network: &MemoryNetwork) -> ConnectionManager<MemoryTransport> {
    ConnectionManager::new(network.transport(), ConnectionConfig::default())
}

/// Feed the manager every input that arrives before `deadline`.
async fn pump_until_deadline(
    manager: &mut ConnectionManager<MemoryTransport>,
    deadline: Instant,
) {
    while let Ok(Some(input)) = tokio::time::timeout_at(deadline, manager.next_input()).await {
        let _ = manager.handle_input(input);
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_every_interval() {
    init_test_tracing();
    let network = MemoryNetwork::new();
    let mut manager = manager(&network);
    let id = PeerId::generate();
    manager.initialize(id.clone()).await.unwrap();

    network.drop_signaling(&id);
    pump_until(&mut manager, |e| {
        matches!(e, ManagerEvent::EndpointDisconnected)
    })
    .await;
    let lost_at = Instant::now();

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.is_reconnecting());
    assert_eq!(network.reconnect_attempts(&id), 1);

    pump_until_deadline(&mut manager, lost_at + Duration::from_secs(4)).await;
    assert_eq!(network.reconnect_attempts(&id), 1);

    pump_until_deadline(&mut manager, lost_at + Duration::from_secs(12)).await;
    assert_eq!(network.reconnect_attempts(&id), 3);

    network.restore_signaling(&id);
    let event = pump_until(&mut manager, |e| matches!(e, ManagerEvent::EndpointOpened(_))).await;
    assert!(matches!(event, ManagerEvent::EndpointOpened(reopened) if reopened == id));
    let elapsed = Instant::now() - lost_at;
    assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    assert_eq!(network.reconnect_attempts(&id), 4);
    assert_eq!(manager.state(), ConnectionState::Open);
    assert!(!manager.is_reconnecting());

    pump_until_deadline(&mut manager, Instant::now() + Duration::from_secs(30)).await;
    assert_eq!(network.reconnect_attempts(&id), 4);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_stops_reconnecting() {
    let network = MemoryNetwork::new();
    let mut manager = manager(&network);
    let id = PeerId::generate();
    manager.initialize(id.clone()).await.unwrap();

    network.drop_signaling(&id);
    pump_until(&mut manager, |e| {
        matches!(e, ManagerEvent::EndpointDisconnected)
    })
    .await;
    manager.destroy();

    pump_until_deadline(&mut manager, Instant::now() + Duration::from_secs(30)).await;
    assert_eq!(network.reconnect_attempts(&id), 1);
    assert_eq!(manager.state(), ConnectionState::Destroyed);
    assert!(!network.is_registered(&id));
}

#[tokio::test(start_paused = true)]
async fn test_closed_endpoint_is_reopened_with_same_id() {
    let network = MemoryNetwork::new();
    let mut manager = manager(&network);
    let id = PeerId::generate();
    manager.initialize(id.clone()).await.unwrap();
    assert_eq!(network.open_attempts(&id), 1);

    network.close_endpoint(&id);
    pump_until(&mut manager, |e| {
        matches!(e, ManagerEvent::EndpointDisconnected)
    })
    .await;
    assert!(!network.is_registered(&id));

    pump_until(&mut manager, |e| matches!(e, ManagerEvent::EndpointOpened(_))).await;
    assert_eq!(network.open_attempts(&id), 2);
    assert!(network.is_registered(&id));
    assert_eq!(manager.local_id(), Some(&id));
}

#[tokio::test]
async fn test_transient_error_keeps_links() {
    let network = MemoryNetwork::new();
    let mut a = manager(&network);
    let mut b = manager(&network);
    let (a_id, b_id) = (PeerId::generate(), PeerId::generate());
    a.initialize(a_id.clone()).await.unwrap();
    b.initialize(b_id.clone()).await.unwrap();

    a.connect(&b_id).unwrap();
    pump_until(&mut a, |e| matches!(e, ManagerEvent::LinkOpened(_))).await;
    pump_until(&mut b, |e| matches!(e, ManagerEvent::LinkOpened(_))).await;

    network.inject_error(&a_id, TransportError::Transient("network blip".into()));
    network.inject_error(&a_id, TransportError::Other("marker".into()));
    let event = pump_until(&mut a, |e| matches!(e, ManagerEvent::Failed(_))).await;
    let ManagerEvent::Failed(err) = event else {
        unreachable!()
    };
    assert!(matches!(err, Error::Transport(msg) if msg == "marker"));

    assert!(!a.is_reconnecting());
    assert_eq!(network.reconnect_attempts(&a_id), 0);
    assert!(a.is_connected(&b_id));
    assert_eq!(a.state(), ConnectionState::Linked);
    assert_eq!(network.open_channels_between(&a_id, &b_id), 1);
}

#[tokio::test]
async fn test_link_failure_frees_slot() {
    let network = MemoryNetwork::new();
    let mut a = manager(&network);
    let mut b = manager(&network);
    let (a_id, b_id) = (PeerId::generate(), PeerId::generate());
    a.initialize(a_id.clone()).await.unwrap();
    b.initialize(b_id.clone()).await.unwrap();

    a.connect(&b_id).unwrap();
    pump_until(&mut a, |e| matches!(e, ManagerEvent::LinkOpened(_))).await;
    pump_until(&mut b, |e| matches!(e, ManagerEvent::LinkOpened(_))).await;
    let mut changes = a.subscribe();

    network.sever(&a_id, &b_id, "connection reset");
    let event = pump_until(&mut a, |e| matches!(e, ManagerEvent::LinkClosed { .. })).await;
    let ManagerEvent::LinkClosed {
        peer,
        was_open,
        reason,
    } = event
    else {
        unreachable!()
    };
    assert_eq!(peer, b_id);
    assert!(was_open);
    assert_eq!(reason.as_deref(), Some("connection reset"));

    let change = changes.try_recv().unwrap();
    assert_eq!(change.peer, b_id);
    assert!(!change.connected);

    assert_eq!(a.link_count(), 0);
    assert_eq!(a.state(), ConnectionState::Open);

    a.connect(&b_id).unwrap();
    pump_until(&mut a, |e| matches!(e, ManagerEvent::LinkOpened(_))).await;
    assert_eq!(network.open_channels_between(&a_id, &b_id), 1);
}
