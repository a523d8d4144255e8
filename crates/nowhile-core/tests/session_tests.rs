//! Integration tests for sessions talking over the in-memory network.

mod common;

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use common::{
    connect_peers, create_temp_dir, create_test_file, eventually, init_test_tracing, pump_until,
    random_bytes, start_peer, test_config, wait_for,
};
use nowhile_core::config::{ConnectionConfig, TransferConfig};
use nowhile_core::connection::{ConnectionManager, ConnectionState, ManagerEvent};
use nowhile_core::identity::{LocalIdentity, PeerId};
use nowhile_core::protocol::{FileDescriptor, Frame};
use nowhile_core::recent::RecencyCache;
use nowhile_core::session::{Session, SessionEvent};
use nowhile_core::store::{ArtifactMeta, BlobStore, MemoryBlobStore, StoredFile};
use nowhile_core::transfer::{
    TransferCoordinator, TransferDirection, TransferEvent, TransferStatus,
};
use nowhile_core::transport::memory::MemoryNetwork;
use nowhile_core::transport::{Channel, ChannelEvent, EndpointEvent, TransportLink};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::Notify;
use uuid::Uuid;

#[tokio::test]
async fn test_ten_mebibytes_stream_as_160_chunks() {
    init_test_tracing();
    let network = MemoryNetwork::new();
    let mut sender = start_peer(&network, "Sender").await;

    let receiver_id = PeerId::generate();
    let mut receiver = ConnectionManager::new(network.transport(), ConnectionConfig::default());
    receiver.initialize(receiver_id.clone()).await.unwrap();

    sender.handle.connect(receiver_id.as_str()).await.unwrap();
    wait_for(&mut sender.events, |e| {
        matches!(e, SessionEvent::ConnectionChanged { connected: true, .. })
    })
    .await;

    let tmp_dir = create_temp_dir();
    let content = random_bytes(10 * 1024 * 1024);
    let path = create_test_file(tmp_dir.path(), "big.bin", &content);
    sender.handle.queue_file(&path).await.unwrap();

    let started = sender
        .handle
        .send_queue_to(vec![receiver_id.clone()])
        .await
        .unwrap();
    assert_eq!(started.len(), 1);

    let mut coordinator = TransferCoordinator::new(TransferConfig::default());
    let (mut metadata, mut chunks, mut ends) = (0, 0, 0);
    let artifact = loop {
        let event = pump_until(&mut receiver, |e| matches!(e, ManagerEvent::Frame { .. })).await;
        let ManagerEvent::Frame { from, frame } = event else {
            unreachable!()
        };
        match &frame {
            Frame::Metadata(descriptor) => {
                assert_eq!(descriptor.transfer_id, started[0]);
                assert_eq!(descriptor.file_name, "big.bin");
                assert_eq!(descriptor.file_size, 10_485_760);
                metadata += 1;
            }
            Frame::Chunk { data, .. } => {
                assert_eq!(data.len(), 64 * 1024);
                chunks += 1;
            }
            Frame::End { .. } => ends += 1,
            Frame::Handshake(_) | Frame::Chat(_) => {}
        }
        if let Some(artifact) = coordinator.on_frame(&from, "Sender", frame).unwrap() {
            break artifact;
        }
    };

    assert_eq!((metadata, chunks, ends), (1, 160, 1));
    assert_eq!(artifact.bytes.len(), 10_485_760);
    assert!(artifact.bytes == content);
    assert!(!coordinator.has_buffer(&started[0]));

    eventually(|| {
        let handle = &sender.handle;
        async move {
            handle
                .snapshot()
                .await
                .unwrap()
                .sent
                .iter()
                .any(|log| log.status == TransferStatus::Completed)
        }
    })
    .await;
    sender.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_round_trip_between_sessions() {
    init_test_tracing();
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    connect_peers(&mut alice, &mut bob).await;

    let tmp_dir = create_temp_dir();
    let content = random_bytes(300 * 1024 + 17);
    let path = create_test_file(tmp_dir.path(), "notes.txt", &content);
    let queued = alice.handle.queue_file(&path).await.unwrap();
    assert_eq!(queued.mime_type, "text/plain");

    let started = alice.handle.send_queue().await.unwrap();
    assert_eq!(started.len(), 1);
    let transfer_id = started[0];
    assert!(alice.handle.snapshot().await.unwrap().queue.is_empty());

    let mut progress = Vec::new();
    let mut completed = None;
    let stored = loop {
        match wait_for(&mut bob.events, |_| true).await {
            SessionEvent::Transfer(TransferEvent::Started(record)) => {
                assert_eq!(record.id, transfer_id);
                assert_eq!(record.direction, TransferDirection::Incoming);
                assert_eq!(record.progress, 0);
            }
            SessionEvent::Transfer(TransferEvent::Progress {
                transfer_id: id,
                progress: value,
                ..
            }) if id == transfer_id => progress.push(value),
            SessionEvent::Transfer(TransferEvent::Completed(record)) => completed = Some(record),
            SessionEvent::FileReceived(stored) => break stored,
            _ => {}
        }
    };

    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    let completed = completed.expect("no completion event");
    assert_eq!(completed.progress, 100);
    assert_eq!(completed.status, TransferStatus::Completed);
    assert_eq!(completed.bytes_transferred, content.len() as u64);

    assert_eq!(stored.transfer_id, transfer_id);
    assert_eq!(stored.name, "notes.txt");
    assert_eq!(stored.sender_id, alice.id());
    assert_eq!(stored.sender_name, "Alice");

    let (_, bytes) = bob.store.load(&transfer_id).unwrap().unwrap();
    assert!(bytes == content);
    assert_eq!(bob.handle.stored_files().await.unwrap().len(), 1);

    let snapshot = bob.handle.snapshot().await.unwrap();
    assert!(snapshot
        .transfers
        .iter()
        .all(|t| t.id != transfer_id || t.status == TransferStatus::Completed));

    alice.handle.shutdown().await.unwrap();
    bob.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_empty_file_completes() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    connect_peers(&mut alice, &mut bob).await;

    let tmp_dir = create_temp_dir();
    let path = create_test_file(tmp_dir.path(), "empty.dat", b"");
    alice.handle.queue_file(&path).await.unwrap();
    alice.handle.send_queue().await.unwrap();

    let SessionEvent::FileReceived(stored) =
        wait_for(&mut bob.events, |e| matches!(e, SessionEvent::FileReceived(_))).await
    else {
        unreachable!()
    };
    assert_eq!(stored.size, 0);
    assert_eq!(stored.name, "empty.dat");
}

#[tokio::test]
async fn test_handshake_records_recent_peer() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    connect_peers(&mut alice, &mut bob).await;

    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Linked);
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].id, bob.id());
    assert_eq!(snapshot.peers[0].name, "Bob");
    assert!(snapshot.peers[0].is_secure);

    let recent = alice.handle.recent_peers().await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, bob.id());
    assert_eq!(recent[0].name, "Bob");

    assert!(alice.handle.disconnect(&bob.id()).await.unwrap());
    assert!(alice.handle.recent_peers().await.unwrap().is_empty());
    assert!(!alice.handle.disconnect(&bob.id()).await.unwrap());

    wait_for(&mut bob.events, |e| {
        matches!(e, SessionEvent::ConnectionChanged { connected: false, .. })
    })
    .await;
    assert!(bob.handle.snapshot().await.unwrap().peers.is_empty());
}

#[tokio::test]
async fn test_chat_reaches_every_peer() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    let mut carol = start_peer(&network, "Carol").await;
    connect_peers(&mut alice, &mut bob).await;
    connect_peers(&mut alice, &mut carol).await;

    let sent = alice.handle.send_chat("hello both").await.unwrap();
    assert_eq!(sent.sender_name, "Alice");

    for peer in [&mut bob, &mut carol] {
        let SessionEvent::ChatReceived { from, message } =
            wait_for(&mut peer.events, |e| matches!(e, SessionEvent::ChatReceived { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(from, alice.id());
        assert_eq!(message.id, sent.id);
        assert_eq!(message.text, "hello both");
    }
}

#[tokio::test]
async fn test_repeated_connect_keeps_one_link() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    connect_peers(&mut alice, &mut bob).await;

    alice.handle.connect(bob.id().as_str()).await.unwrap();
    alice.handle.connect(bob.id().as_str()).await.unwrap();

    assert_eq!(network.open_channels_between(&alice.id(), &bob.id()), 1);
    assert_eq!(alice.handle.snapshot().await.unwrap().peers.len(), 1);
}

#[tokio::test]
async fn test_simultaneous_dial_settles_on_one_link() {
    let network = MemoryNetwork::new();
    let alice = start_peer(&network, "Alice").await;
    let bob = start_peer(&network, "Bob").await;
    let (a_id, b_id) = (alice.id(), bob.id());

    let (a, b) = tokio::join!(
        alice.handle.connect(b_id.as_str()),
        bob.handle.connect(a_id.as_str())
    );
    a.unwrap();
    b.unwrap();

    eventually(|| {
        let (network, alice, bob) = (&network, &alice.handle, &bob.handle);
        let (a_id, b_id) = (&a_id, &b_id);
        async move {
            network.open_channels_between(a_id, b_id) == 1
                && alice.snapshot().await.unwrap().peers.len() == 1
                && bob.snapshot().await.unwrap().peers.len() == 1
        }
    })
    .await;
}

#[tokio::test]
async fn test_link_loss_is_surfaced() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    connect_peers(&mut alice, &mut bob).await;

    network.sever(&alice.id(), &bob.id(), "ice failed");

    let bob_id = bob.id();
    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::ConnectionChanged { peer, connected: false } if *peer == bob_id)
    })
    .await;

    let report = tokio::time::timeout(common::WAIT, alice.errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.code, Some("E105"));
    assert_eq!(report.peer, Some(bob.id()));
    assert!(!report.fatal);

    assert!(alice.handle.snapshot().await.unwrap().peers.is_empty());
    // Unexpected loss keeps the peer around for a quick reconnect.
    assert_eq!(alice.handle.recent_peers().await.unwrap().len(), 1);
    assert!(matches!(
        alice.handle.send_chat("still there?").await,
        Err(nowhile_core::Error::NoRecipients)
    ));
}

#[tokio::test]
async fn test_orphan_frames_create_no_state() {
    let network = MemoryNetwork::new();
    let mut session = start_peer(&network, "Receiver").await;
    let session_id = session.id();

    let raw_id = PeerId::generate();
    let mut raw = ConnectionManager::new(network.transport(), ConnectionConfig::default());
    raw.initialize(raw_id.clone()).await.unwrap();
    raw.connect(&session_id).unwrap();
    pump_until(&mut raw, |e| matches!(e, ManagerEvent::LinkOpened(_))).await;

    let known = Uuid::new_v4();
    let orphan = Uuid::new_v4();
    let frames = [
        Frame::Metadata(FileDescriptor {
            transfer_id: known,
            file_name: "real.bin".to_string(),
            file_size: 10,
            file_type: "application/octet-stream".to_string(),
        }),
        Frame::Chunk {
            transfer_id: orphan,
            data: vec![1, 2, 3],
        },
        Frame::End {
            transfer_id: orphan,
        },
        Frame::Chat(nowhile_core::protocol::ChatMessage::new("marker", "raw")),
    ];
    for frame in &frames {
        assert!(raw.send_to(&session_id, frame));
    }

    wait_for(&mut session.events, |e| {
        matches!(e, SessionEvent::ChatReceived { .. })
    })
    .await;

    let snapshot = session.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.transfers.len(), 1);
    assert_eq!(snapshot.transfers[0].id, known);
    assert_eq!(snapshot.transfers[0].bytes_transferred, 0);
    assert!(matches!(
        session.errors.try_recv(),
        Err(TryRecvError::Empty)
    ));
    assert!(session.store.list().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_silences_everything() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;
    let mut bob = start_peer(&network, "Bob").await;
    connect_peers(&mut alice, &mut bob).await;
    let a_id = alice.id();

    alice.handle.shutdown().await.unwrap();
    wait_for(&mut alice.events, |e| {
        matches!(
            e,
            SessionEvent::EndpointStateChanged(ConnectionState::Destroyed)
        )
    })
    .await;
    assert!(!network.is_registered(&a_id));
    assert_eq!(network.open_channels_between(&a_id, &bob.id()), 0);

    // Faults after teardown must not wake anything up.
    network.drop_signaling(&a_id);
    network.close_endpoint(&a_id);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(network.reconnect_attempts(&a_id), 0);
    assert!(matches!(alice.events.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(alice.errors.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(
        alice.handle.connect(bob.id().as_str()).await,
        Err(nowhile_core::Error::Destroyed)
    ));
}

#[tokio::test]
async fn test_identity_and_recent_peers_survive_restart() {
    let network = MemoryNetwork::new();
    let tmp_dir = create_temp_dir();
    let identity_path = tmp_dir.path().join("identity.json");
    let recent_path = tmp_dir.path().join("recent_peers.json");
    let config = test_config("Alice");
    let window = config.recent.window;

    let original = LocalIdentity::load_or_create(&identity_path, "Alice").unwrap();
    network.reserve(&original.id);

    let session = Session::new(
        network.transport(),
        config.clone(),
        original.clone(),
        Arc::new(MemoryBlobStore::new(config.storage.retention)),
    )
    .with_identity_path(identity_path.clone())
    .with_recent(RecencyCache::load_from(recent_path.clone(), window).unwrap());
    let mut events = session.subscribe();
    let handle = session.start().await.unwrap();
    let regenerated = handle.local_id();
    assert_ne!(regenerated, original.id);

    let bob = start_peer(&network, "Bob").await;
    let bob_id = bob.id();
    handle.connect(bob_id.as_str()).await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::PeerUpdated(link) if link.id == bob_id)
    })
    .await;
    handle.shutdown().await.unwrap();

    let saved = LocalIdentity::load_from(&identity_path).unwrap().unwrap();
    assert_eq!(saved.id, regenerated);
    let recent = RecencyCache::load_from(recent_path.clone(), window)
        .unwrap()
        .list();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, bob_id);

    let identity = LocalIdentity::load_or_create(&identity_path, "Alice").unwrap();
    let session = Session::new(
        network.transport(),
        config.clone(),
        identity,
        Arc::new(MemoryBlobStore::new(config.storage.retention)),
    )
    .with_identity_path(identity_path.clone())
    .with_recent(RecencyCache::load_from(recent_path, window).unwrap());
    let handle = session.start().await.unwrap();

    assert_eq!(handle.local_id(), regenerated);
    let recent = handle.recent_peers().await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, bob_id);
    assert_eq!(recent[0].name, "Bob");
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replaced_link_abandons_inbound_transfer() {
    let network = MemoryNetwork::new();
    let mut session = start_peer(&network, "Receiver").await;
    let session_id = session.id();

    // The lowest possible id, so its incoming link always wins.
    let raw_id = PeerId::parse("222222").unwrap();
    let raw = network.transport();
    let mut raw_events = raw.open(&raw_id);
    assert!(matches!(raw_events.recv().await, Some(EndpointEvent::Opened(_))));

    let mut first = raw.connect_channel(&session_id).unwrap();
    assert!(matches!(first.events.recv().await, Some(ChannelEvent::Open)));
    let transfer_id = Uuid::new_v4();
    first
        .channel
        .send(&Frame::Metadata(FileDescriptor {
            transfer_id,
            file_name: "half.bin".to_string(),
            file_size: 10,
            file_type: "application/octet-stream".to_string(),
        }))
        .unwrap();
    first
        .channel
        .send(&Frame::Chunk {
            transfer_id,
            data: vec![1; 4],
        })
        .unwrap();
    wait_for(&mut session.events, |e| {
        matches!(e, SessionEvent::Transfer(TransferEvent::Progress { transfer_id: id, bytes_transferred: 4, .. }) if *id == transfer_id)
    })
    .await;

    let mut second = raw.connect_channel(&session_id).unwrap();
    assert!(matches!(second.events.recv().await, Some(ChannelEvent::Open)));
    for frame in [
        Frame::Chunk {
            transfer_id,
            data: vec![2; 6],
        },
        Frame::End { transfer_id },
        Frame::Chat(nowhile_core::protocol::ChatMessage::new("marker", "raw")),
    ] {
        second.channel.send(&frame).unwrap();
    }

    let mut seen = Vec::new();
    loop {
        match wait_for(&mut session.events, |_| true).await {
            SessionEvent::ChatReceived { .. } => break,
            event => seen.push(event),
        }
    }

    let closed = seen
        .iter()
        .position(|e| {
            matches!(e, SessionEvent::ConnectionChanged { peer, connected: false } if *peer == raw_id)
        })
        .expect("replaced link not reported closed");
    let reopened = seen
        .iter()
        .position(|e| {
            matches!(e, SessionEvent::ConnectionChanged { peer, connected: true } if *peer == raw_id)
        })
        .expect("replacement link not reported open");
    assert!(closed < reopened);
    assert!(seen.iter().any(|e| {
        matches!(e, SessionEvent::Transfer(TransferEvent::Abandoned(record)) if record.id == transfer_id)
    }));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, SessionEvent::FileReceived(_))));

    assert!(matches!(first.events.recv().await, Some(ChannelEvent::Close)));
    assert_eq!(network.open_channels_between(&raw_id, &session_id), 1);
    assert!(session.store.list().unwrap().is_empty());
    assert!(session
        .handle
        .snapshot()
        .await
        .unwrap()
        .transfers
        .iter()
        .all(|t| t.id != transfer_id));
}

/// Blocks every save until the test lets it through.
struct GatedStore {
    inner: MemoryBlobStore,
    entered: Arc<Notify>,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl BlobStore for GatedStore {
    fn save(&self, transfer_id: Uuid, bytes: &[u8], meta: &ArtifactMeta) -> nowhile_core::Result<StoredFile> {
        self.entered.notify_one();
        let _ = self.gate.lock().unwrap().recv();
        self.inner.save(transfer_id, bytes, meta)
    }

    fn list(&self) -> nowhile_core::Result<Vec<StoredFile>> {
        self.inner.list()
    }

    fn load(&self, transfer_id: &Uuid) -> nowhile_core::Result<Option<(StoredFile, Vec<u8>)>> {
        self.inner.load(transfer_id)
    }

    fn delete(&self, transfer_id: &Uuid) -> nowhile_core::Result<bool> {
        self.inner.delete(transfer_id)
    }

    fn prune_expired(&self) -> nowhile_core::Result<Vec<StoredFile>> {
        self.inner.prune_expired()
    }
}

#[tokio::test]
async fn test_shutdown_during_store_save_stays_silent() {
    let network = MemoryNetwork::new();
    let mut alice = start_peer(&network, "Alice").await;

    let (release, gate) = mpsc::channel();
    let entered = Arc::new(Notify::new());
    let config = test_config("Bob");
    let store = Arc::new(GatedStore {
        inner: MemoryBlobStore::new(config.storage.retention),
        entered: Arc::clone(&entered),
        gate: Mutex::new(gate),
    });
    let bob = Session::new(
        network.transport(),
        config,
        LocalIdentity::generate("Bob"),
        store.clone(),
    );
    let mut bob_events = bob.subscribe();
    let mut bob_errors = bob.subscribe_errors();
    let bob = bob.start().await.unwrap();
    let bob_id = bob.local_id();

    alice.handle.connect(bob_id.as_str()).await.unwrap();
    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::PeerUpdated(link) if link.id == bob_id)
    })
    .await;

    let tmp_dir = create_temp_dir();
    let path = create_test_file(tmp_dir.path(), "late.txt", b"arrives during shutdown");
    alice.handle.queue_file(&path).await.unwrap();
    alice.handle.send_queue().await.unwrap();

    tokio::time::timeout(common::WAIT, entered.notified())
        .await
        .expect("store never asked to save");

    let stopping = tokio::spawn({
        let bob = bob.clone();
        async move { bob.shutdown().await }
    });
    // Teardown has started once the link is gone.
    wait_for(&mut alice.events, |e| {
        matches!(e, SessionEvent::ConnectionChanged { connected: false, .. })
    })
    .await;
    release.send(()).unwrap();
    tokio::time::timeout(common::WAIT, stopping)
        .await
        .expect("shutdown stalled")
        .unwrap()
        .unwrap();

    let mut after = Vec::new();
    loop {
        match bob_events.try_recv() {
            Ok(event) => after.push(event),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    assert!(!after
        .iter()
        .any(|e| matches!(e, SessionEvent::FileReceived(_))));
    assert!(matches!(
        after.last(),
        Some(SessionEvent::EndpointStateChanged(ConnectionState::Destroyed))
    ));
    assert!(matches!(bob_errors.try_recv(), Err(TryRecvError::Empty)));
    assert!(matches!(
        bob.snapshot().await,
        Err(nowhile_core::Error::Destroyed)
    ));
}
