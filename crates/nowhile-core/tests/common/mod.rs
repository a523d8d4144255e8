//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nowhile_core::config::Config;
use nowhile_core::connection::{ConnectionManager, ManagerEvent};
use nowhile_core::error::ErrorReport;
use nowhile_core::identity::{LocalIdentity, PeerId};
use nowhile_core::session::{Session, SessionEvent, SessionHandle};
use nowhile_core::store::MemoryBlobStore;
use nowhile_core::transport::memory::MemoryNetwork;
use nowhile_core::transport::TransportLink;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// How long a test waits for something before giving up.
pub const WAIT: Duration = Duration::from_secs(30);

/// Route tracing output to the test harness. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "nowhile_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Create a temporary directory for testing.
pub fn create_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Create a test file with given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes of specified size.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A started session plus everything a test needs to observe it.
pub struct TestPeer {
    pub handle: SessionHandle,
    pub events: broadcast::Receiver<SessionEvent>,
    pub errors: broadcast::Receiver<ErrorReport>,
    pub store: Arc<MemoryBlobStore>,
}

impl TestPeer {
    pub fn id(&self) -> PeerId {
        self.handle.local_id()
    }
}

/// Config with a fixed display name and fast identity retries.
pub fn test_config(name: &str) -> Config {
    let mut config = Config::default();
    config.general.display_name = name.to_string();
    config.connection.identity_retry_delay = Duration::from_millis(10);
    config
}

/// Start a session named `name` on `network`, storing received files in
/// memory.
pub async fn start_peer(network: &MemoryNetwork, name: &str) -> TestPeer {
    start_peer_with(network, test_config(name)).await
}

/// Start a session with an explicit config.
pub async fn start_peer_with(network: &MemoryNetwork, config: Config) -> TestPeer {
    let store = Arc::new(MemoryBlobStore::new(config.storage.retention));
    let identity = LocalIdentity::generate(config.general.display_name.clone());
    let session = Session::new(network.transport(), config, identity, store.clone());
    let events = session.subscribe();
    let errors = session.subscribe_errors();
    let handle = session.start().await.expect("Failed to start session");

    TestPeer {
        handle,
        events,
        errors,
        store,
    }
}

/// Wait for the first event matching `pred`, skipping anything else.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pred: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if pred(&event) => return event,
            Ok(Ok(_)) => {}
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                tracing::debug!(skipped, "Test receiver lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event bus closed"),
            Err(_) => panic!("timed out waiting for session event"),
        }
    }
}

/// Connect `a` to `b` and wait until both sides have exchanged handshakes.
pub async fn connect_peers(a: &mut TestPeer, b: &mut TestPeer) {
    let a_id = a.id();
    let b_id = b.id();
    a.handle
        .connect(b_id.as_str())
        .await
        .expect("connect rejected");

    wait_for(&mut a.events, |e| {
        matches!(e, SessionEvent::PeerUpdated(link) if link.id == b_id)
    })
    .await;
    wait_for(&mut b.events, |e| {
        matches!(e, SessionEvent::PeerUpdated(link) if link.id == a_id)
    })
    .await;
}

/// Poll `check` until it holds or the wait runs out.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drive a bare connection manager until it produces an event matching
/// `done`.
pub async fn pump_until<T, F>(manager: &mut ConnectionManager<T>, mut done: F) -> ManagerEvent
where
    T: TransportLink,
    F: FnMut(&ManagerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let input = tokio::time::timeout_at(deadline, manager.next_input())
            .await
            .expect("timed out waiting for manager input")
            .expect("manager input queue closed");
        if let Some(event) = manager.handle_input(input) {
            if done(&event) {
                return event;
            }
        }
    }
}
