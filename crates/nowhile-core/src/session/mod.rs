//! Session orchestration.
//!
//! A [`Session`] ties the connection manager, transfer coordinator,
//! producer pool, send queue, recent peer cache and blob store together.
//! It is built explicitly and started once; after that every interaction
//! goes through a cloneable [`SessionHandle`].
//!
//! ```text
//!   SessionHandle ──commands──► ┌──────────────────────────┐
//!                                │     orchestration task    │
//!   transport ──ManagerInput───► │  manager · coordinator ·  │ ──► SessionEvent bus
//!   producers ──ProducerMessage► │  queue · recent · store   │ ──► ErrorReport bus
//!                                └──────────────────────────┘
//! ```
//!
//! All state lives in that one task, so nothing in it needs a lock.
//! Observers subscribe to the event and error buses; any number of
//! subscribers can listen at once.
//!
//! ## Startup
//!
//! [`Session::start`] registers the local endpoint. If the transport
//! rejects the id, registration is retried `identity_attempts` times
//! `identity_retry_delay` apart. After that a new id is generated, saved,
//! and announced with [`SessionEvent::IdentityRegenerated`]. After
//! `max_identity_regenerations` regenerations startup fails with
//! `Error::IdentityExhausted`.
//!
//! The same budget covers a running session: if the transport closes the
//! endpoint and then refuses the id on every re-open, a new id is adopted
//! and [`SessionHandle::local_id`] follows it. Running out of
//! regenerations stops the session.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{
    ConnectionChanged, ConnectionManager, ConnectionState, ManagerEvent, PeerLink,
};
use crate::error::{Error, ErrorReport, Result};
use crate::identity::{LocalIdentity, PeerId};
use crate::producer::{ProducerMessage, ProducerPool};
use crate::protocol::{ChatMessage, Frame, PeerInfo};
use crate::queue::{QueuedFile, SendQueue};
use crate::recent::{RecencyCache, RecentPeer};
use crate::store::{ArtifactMeta, BlobStore, StoredFile};
use crate::transfer::{
    ReceivedArtifact, SentFileLog, TransferCoordinator, TransferEvent, TransferRecord,
};
use crate::transport::TransportLink;

const EVENT_BUS_CAPACITY: usize = 1024;
const ERROR_BUS_CAPACITY: usize = 64;

/// Something observers may want to react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The local endpoint changed state
    EndpointStateChanged(ConnectionState),
    /// The local id was replaced because the old one stayed unavailable
    IdentityRegenerated {
        /// Rejected id
        old: PeerId,
        /// Replacement id
        new: PeerId,
    },
    /// A link opened or closed
    ConnectionChanged {
        /// Peer on the other end
        peer: PeerId,
        /// Whether the link is now open
        connected: bool,
    },
    /// A peer introduced itself or updated its details
    PeerUpdated(PeerLink),
    /// Transfer progress
    Transfer(TransferEvent),
    /// A received file was stored
    FileReceived(StoredFile),
    /// A chat message arrived
    ChatReceived {
        /// Sender
        from: PeerId,
        /// The message
        message: ChatMessage,
    },
}

/// Point-in-time view of the session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Local peer id
    pub local_id: PeerId,
    /// Endpoint state
    pub state: ConnectionState,
    /// Handshaken peers with open links
    pub peers: Vec<PeerLink>,
    /// Active transfers
    pub transfers: Vec<TransferRecord>,
    /// Files waiting to be sent
    pub queue: Vec<QueuedFile>,
    /// Finished outbound transfers
    pub sent: Vec<SentFileLog>,
}

enum Command {
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    DisconnectAll {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    QueueFile {
        path: PathBuf,
        reply: oneshot::Sender<Result<QueuedFile>>,
    },
    RemoveQueued {
        id: Uuid,
        reply: oneshot::Sender<Option<QueuedFile>>,
    },
    SendQueue {
        recipients: Option<Vec<PeerId>>,
        reply: oneshot::Sender<Result<Vec<Uuid>>>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<ChatMessage>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    RecentPeers {
        reply: oneshot::Sender<Vec<RecentPeer>>,
    },
    ClearRecent {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

fn surface(errors: &broadcast::Sender<ErrorReport>, report: ErrorReport) {
    if report.fatal {
        tracing::error!(code = ?report.code, peer = ?report.peer, transfer = ?report.transfer, "{}", report.message);
    } else {
        tracing::warn!(code = ?report.code, peer = ?report.peer, transfer = ?report.transfer, "{}", report.message);
    }
    let _ = errors.send(report);
}

fn regenerate_identity(
    identity: &mut LocalIdentity,
    path: Option<&Path>,
    events: &broadcast::Sender<SessionEvent>,
    errors: &broadcast::Sender<ErrorReport>,
) {
    let old = identity.regenerate();
    tracing::info!(old = %old, new = %identity.id, "Assigned new identity");

    if let Some(path) = path {
        if let Err(e) = identity.save_to(path) {
            surface(errors, ErrorReport::from(&e));
        }
    }

    let _ = events.send(SessionEvent::IdentityRegenerated {
        old,
        new: identity.id.clone(),
    });
}

/// A configured session that has not started yet.
pub struct Session<T: TransportLink> {
    manager: ConnectionManager<T>,
    config: Config,
    identity: LocalIdentity,
    identity_path: Option<PathBuf>,
    store: Arc<dyn BlobStore>,
    recent: RecencyCache,
    events: broadcast::Sender<SessionEvent>,
    errors: broadcast::Sender<ErrorReport>,
}

impl<T: TransportLink> Session<T> {
    /// Build a session. Recent peers are kept in memory unless
    /// [`with_recent`](Self::with_recent) supplies a persisted cache.
    pub fn new(
        transport: T,
        config: Config,
        identity: LocalIdentity,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        let manager = ConnectionManager::new(transport, config.connection.clone());
        let recent = RecencyCache::in_memory(config.recent.window);
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (errors, _) = broadcast::channel(ERROR_BUS_CAPACITY);

        Self {
            manager,
            config,
            identity,
            identity_path: None,
            store,
            recent,
            events,
            errors,
        }
    }

    /// Save regenerated identities to `path`.
    #[must_use]
    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = Some(path.into());
        self
    }

    /// Use `recent` as the recent peer cache. It is saved again when the
    /// session shuts down.
    #[must_use]
    pub fn with_recent(mut self, recent: RecencyCache) -> Self {
        self.recent = recent;
        self
    }

    /// Subscribe to session events. Subscribe before
    /// [`start`](Self::start) to observe startup.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to surfaced errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.errors.subscribe()
    }

    /// Subscribe to raw link open/close notifications from the manager.
    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionChanged> {
        self.manager.subscribe()
    }

    /// Identity the session will present.
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Register the local endpoint and spawn the orchestration task.
    ///
    /// # Errors
    ///
    /// - `Error::IdentityExhausted` if no id could be registered
    /// - `Error::Timeout` if the transport never answered
    /// - any other transport failure during registration
    pub async fn start(mut self) -> Result<SessionHandle> {
        let regenerations = self.register().await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (local_id_tx, local_id_rx) = watch::channel(self.identity.id.clone());
        let handle = SessionHandle {
            local_id: local_id_rx,
            commands: commands_tx,
            events: self.events.clone(),
            errors: self.errors.clone(),
            store: Arc::clone(&self.store),
        };

        let transfer = &self.config.transfer;
        let state = SessionLoop {
            coordinator: TransferCoordinator::new(transfer.clone()),
            producer: ProducerPool::new(transfer.producer_workers, transfer.producer_capacity),
            queue: SendQueue::new(),
            prune_interval: self.config.storage.prune_interval,
            regenerations,
            max_regenerations: self.config.connection.max_identity_regenerations,
            manager: self.manager,
            recent: self.recent,
            store: self.store,
            identity: self.identity,
            identity_path: self.identity_path,
            local_id: local_id_tx,
            saves: JoinSet::new(),
            stopped: CancellationToken::new(),
            events: self.events,
            errors: self.errors,
        };

        tracing::info!(id = %handle.local_id(), "Session started");
        tokio::spawn(state.run(commands_rx));
        Ok(handle)
    }

    async fn register(&mut self) -> Result<u32> {
        let attempts = self.config.connection.identity_attempts.max(1);
        let retry_delay = self.config.connection.identity_retry_delay;
        let max_regenerations = self.config.connection.max_identity_regenerations;
        let mut regenerations = 0;

        loop {
            let mut attempt = 1;
            loop {
                match self.manager.initialize(self.identity.id.clone()).await {
                    Ok(()) => {
                        let _ = self
                            .events
                            .send(SessionEvent::EndpointStateChanged(self.manager.state()));
                        return Ok(regenerations);
                    }
                    Err(Error::IdentityConflict(id)) if attempt < attempts => {
                        tracing::warn!(id = %id, attempt, "Peer id unavailable, retrying");
                        attempt += 1;
                        tokio::time::sleep(retry_delay).await;
                    }
                    Err(Error::IdentityConflict(id)) => {
                        tracing::warn!(id = %id, attempts, "Peer id still unavailable");
                        break;
                    }
                    Err(e) => {
                        surface(&self.errors, ErrorReport::from(&e));
                        return Err(e);
                    }
                }
            }

            if regenerations >= max_regenerations {
                let err = Error::IdentityExhausted(regenerations);
                surface(&self.errors, ErrorReport::from(&err));
                return Err(err);
            }

            regenerations += 1;
            regenerate_identity(
                &mut self.identity,
                self.identity_path.as_deref(),
                &self.events,
                &self.errors,
            );
        }
    }
}

struct SessionLoop<T: TransportLink> {
    manager: ConnectionManager<T>,
    coordinator: TransferCoordinator,
    producer: ProducerPool,
    queue: SendQueue,
    recent: RecencyCache,
    store: Arc<dyn BlobStore>,
    identity: LocalIdentity,
    identity_path: Option<PathBuf>,
    local_id: watch::Sender<PeerId>,
    regenerations: u32,
    max_regenerations: u32,
    prune_interval: Duration,
    saves: JoinSet<()>,
    stopped: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    errors: broadcast::Sender<ErrorReport>,
}

impl<T: TransportLink> SessionLoop<T> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let period = self.prune_interval.max(Duration::from_secs(1));
        let mut prune = tokio::time::interval_at(Instant::now() + period, period);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All session handles dropped");
                        self.shutdown().await;
                        break;
                    };
                    if let ControlFlow::Break(reply) = self.on_command(command) {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                }
                Some(input) = self.manager.next_input() => {
                    let stop = self
                        .manager
                        .handle_input(input)
                        .is_some_and(|event| self.on_manager_event(event).is_break());
                    if stop {
                        self.shutdown().await;
                        break;
                    }
                }
                Some(message) = self.producer.next_message() => {
                    self.on_producer_message(message);
                }
                Some(_) = self.saves.join_next() => {}
                _ = prune.tick() => self.prune(),
            }
            self.flush_transfer_events();
        }

        tracing::info!("Session stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, report: ErrorReport) {
        surface(&self.errors, report);
    }

    fn flush_transfer_events(&mut self) {
        for event in self.coordinator.drain_events() {
            let _ = self.events.send(SessionEvent::Transfer(event));
        }
    }

    fn on_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Connect { peer, reply } => {
                let result = self.manager.connect(&peer);
                if let Err(e) = &result {
                    tracing::debug!(peer = %peer, error = %e, "Connect rejected");
                }
                let _ = reply.send(result);
            }
            Command::Disconnect { peer, reply } => {
                let removed = self.disconnect(&peer);
                if let Err(e) = self.recent.remove(&peer) {
                    self.report(ErrorReport::from(&e));
                }
                let _ = reply.send(removed);
            }
            Command::DisconnectAll { reply } => {
                let peers = self.manager.disconnect_all();
                for (peer, was_open) in &peers {
                    self.abandon(peer);
                    if *was_open {
                        self.emit(SessionEvent::ConnectionChanged {
                            peer: peer.clone(),
                            connected: false,
                        });
                    }
                }
                if let Err(e) = self.recent.clear() {
                    self.report(ErrorReport::from(&e));
                }
                let _ = reply.send(peers.into_iter().map(|(peer, _)| peer).collect());
            }
            Command::QueueFile { path, reply } => {
                let result = QueuedFile::from_path(&path).map(|file| {
                    tracing::debug!(file = %file.name, size = file.size, "Queued file");
                    self.queue.push(file.clone());
                    file
                });
                let _ = reply.send(result);
            }
            Command::RemoveQueued { id, reply } => {
                let _ = reply.send(self.queue.remove(&id));
            }
            Command::SendQueue { recipients, reply } => {
                let _ = reply.send(self.send_queue(recipients));
            }
            Command::SendChat { text, reply } => {
                let message = ChatMessage::new(text, self.identity.name.clone());
                let delivered = self.manager.send_to_all(&Frame::Chat(message.clone()));
                let result = if delivered == 0 {
                    Err(Error::NoRecipients)
                } else {
                    Ok(message)
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::RecentPeers { reply } => {
                let _ = reply.send(self.recent.list());
            }
            Command::ClearRecent { reply } => {
                let _ = reply.send(self.recent.clear());
            }
            Command::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            local_id: self.identity.id.clone(),
            state: self.manager.state(),
            peers: self.manager.peers(),
            transfers: self.coordinator.records(),
            queue: self.queue.files().to_vec(),
            sent: self.coordinator.sent_history().to_vec(),
        }
    }

    fn send_queue(&mut self, recipients: Option<Vec<PeerId>>) -> Result<Vec<Uuid>> {
        let recipients: Vec<PeerId> = match recipients {
            Some(list) => list
                .into_iter()
                .filter(|peer| self.manager.is_connected(peer))
                .collect(),
            None => self.manager.peers().into_iter().map(|p| p.id).collect(),
        };
        if recipients.is_empty() {
            return Err(Error::NoRecipients);
        }

        let files = self.queue.take_all();
        tracing::info!(files = files.len(), recipients = recipients.len(), "Sending queued files");

        let mut started = Vec::with_capacity(files.len() * recipients.len());
        for file in &files {
            for peer in &recipients {
                match self.coordinator.begin_outgoing(file, peer, &self.manager) {
                    Ok(job) => {
                        started.push(job.transfer_id);
                        self.producer.submit(job);
                    }
                    Err(e) => self.report(ErrorReport::from(&e)),
                }
            }
        }
        Ok(started)
    }

    fn disconnect(&mut self, peer: &PeerId) -> bool {
        let Some(was_open) = self.manager.disconnect_peer(peer) else {
            return false;
        };
        self.abandon(peer);
        if was_open {
            self.emit(SessionEvent::ConnectionChanged {
                peer: peer.clone(),
                connected: false,
            });
        }
        true
    }

    fn abandon(&mut self, peer: &PeerId) {
        for transfer_id in self.coordinator.abandon_peer(peer) {
            self.producer.cancel(&transfer_id);
        }
    }

    async fn shutdown(&mut self) {
        self.stopped.cancel();
        self.manager.destroy();
        self.producer.shutdown();
        if let Err(e) = self.recent.save() {
            tracing::warn!(error = %e, "Failed to save recent peers");
        }
        while self.saves.join_next().await.is_some() {}
        self.emit(SessionEvent::EndpointStateChanged(self.manager.state()));
    }

    fn on_identity_rejected(&mut self, rejected: &PeerId) -> ControlFlow<()> {
        if self.regenerations >= self.max_regenerations {
            let err = Error::IdentityExhausted(self.regenerations);
            self.report(ErrorReport::from(&err));
            return ControlFlow::Break(());
        }

        tracing::warn!(id = %rejected, "Endpoint could not be re-opened under its id");
        self.regenerations += 1;
        regenerate_identity(
            &mut self.identity,
            self.identity_path.as_deref(),
            &self.events,
            &self.errors,
        );
        self.local_id.send_replace(self.identity.id.clone());

        if let Err(e) = self.manager.reopen_as(self.identity.id.clone()) {
            self.report(ErrorReport::from(&e));
            return ControlFlow::Break(());
        }
        self.emit(SessionEvent::EndpointStateChanged(self.manager.state()));
        ControlFlow::Continue(())
    }

    fn on_manager_event(&mut self, event: ManagerEvent) -> ControlFlow<()> {
        match event {
            ManagerEvent::EndpointOpened(_) | ManagerEvent::EndpointDisconnected => {
                self.emit(SessionEvent::EndpointStateChanged(self.manager.state()));
            }
            ManagerEvent::IdentityRejected(id) => return self.on_identity_rejected(&id),
            ManagerEvent::LinkOpened(peer) => {
                let info = PeerInfo::local(&self.identity, true);
                if !self.manager.send_to(&peer, &Frame::Handshake(info)) {
                    tracing::warn!(peer = %peer, "Handshake not delivered");
                }
                self.emit(SessionEvent::ConnectionChanged {
                    peer,
                    connected: true,
                });
            }
            ManagerEvent::LinkClosed {
                peer,
                was_open,
                reason,
            } => {
                self.abandon(&peer);
                if was_open {
                    if let Err(e) = self.recent.touch(&peer) {
                        self.report(ErrorReport::from(&e));
                    }
                    self.emit(SessionEvent::ConnectionChanged {
                        peer: peer.clone(),
                        connected: false,
                    });
                }
                if let Some(reason) = reason {
                    self.report(ErrorReport::from(&Error::LinkLost { peer, reason }));
                }
            }
            ManagerEvent::Frame { from, frame } => self.on_frame(from, frame),
            ManagerEvent::Failed(err) => self.report(ErrorReport::from(&err)),
        }
        ControlFlow::Continue(())
    }

    fn on_frame(&mut self, from: PeerId, frame: Frame) {
        match frame {
            Frame::Handshake(info) => {
                let Some(link) = self.manager.apply_handshake(&from, info) else {
                    tracing::debug!(peer = %from, "Handshake for unknown link");
                    return;
                };
                tracing::info!(peer = %from, name = %link.name, os = %link.os, "Peer identified");
                if let Err(e) = self.recent.record(&from, &link.name) {
                    self.report(ErrorReport::from(&e));
                }
                self.emit(SessionEvent::PeerUpdated(link));
            }
            Frame::Chat(message) => {
                tracing::debug!(peer = %from, "Chat message");
                self.emit(SessionEvent::ChatReceived { from, message });
            }
            frame @ (Frame::Metadata(_) | Frame::Chunk { .. } | Frame::End { .. }) => {
                let transfer = frame.transfer_id();
                let sender_name = self
                    .manager
                    .peer(&from)
                    .map_or_else(|| from.to_string(), |p| p.name.clone());

                match self.coordinator.on_frame(&from, &sender_name, frame) {
                    Ok(Some(artifact)) => self.persist(artifact),
                    Ok(None) => {}
                    Err(e) => {
                        let mut report = ErrorReport::from(&e).with_peer(from);
                        if let Some(transfer) = transfer {
                            report = report.with_transfer(transfer);
                        }
                        self.report(report);
                    }
                }
            }
        }
    }

    fn on_producer_message(&mut self, message: ProducerMessage) {
        let transfer_id = message.transfer_id();
        let peer = self.coordinator.record(&transfer_id).map(|r| r.peer.clone());

        if let Err(e) = self.coordinator.on_producer_message(message, &self.manager) {
            self.producer.cancel(&transfer_id);
            let mut report = ErrorReport::from(&e).with_transfer(transfer_id);
            if let Some(peer) = peer {
                report = report.with_peer(peer);
            }
            self.report(report);
        }
    }

    fn persist(&mut self, artifact: ReceivedArtifact) {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let errors = self.errors.clone();
        let stopped = self.stopped.clone();

        self.saves.spawn(async move {
            let transfer_id = artifact.descriptor.transfer_id;
            let sender = artifact.sender.clone();
            let skip = stopped.clone();
            let saved = tokio::task::spawn_blocking(move || {
                if skip.is_cancelled() {
                    return Err(Error::Destroyed);
                }
                let meta = ArtifactMeta {
                    name: artifact.descriptor.file_name,
                    mime_type: artifact.descriptor.file_type,
                    sender_id: artifact.sender,
                    sender_name: artifact.sender_name,
                };
                store.save(transfer_id, &artifact.bytes, &meta)
            })
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("store task failed: {e}"))));

            if stopped.is_cancelled() {
                tracing::debug!(transfer = %transfer_id, "Session stopped while storing file");
                return;
            }
            match saved {
                Ok(stored) => {
                    let _ = events.send(SessionEvent::FileReceived(stored));
                }
                Err(e) => {
                    tracing::error!(transfer = %transfer_id, error = %e, "Failed to store received file");
                    surface(
                        &errors,
                        ErrorReport::from(&e)
                            .with_peer(sender)
                            .with_transfer(transfer_id),
                    );
                }
            }
        });
    }

    fn prune(&mut self) {
        if let Err(e) = self.recent.prune() {
            self.report(ErrorReport::from(&e));
        }

        let store = Arc::clone(&self.store);
        let errors = self.errors.clone();
        let stopped = self.stopped.clone();
        self.saves.spawn(async move {
            let pruned = tokio::task::spawn_blocking(move || store.prune_expired())
                .await
                .unwrap_or_else(|e| Err(Error::Internal(format!("prune task failed: {e}"))));
            if stopped.is_cancelled() {
                return;
            }
            match pruned {
                Ok(files) if !files.is_empty() => {
                    tracing::debug!(count = files.len(), "Expired files removed");
                }
                Ok(_) => {}
                Err(e) => surface(&errors, ErrorReport::from(&e)),
            }
        });
    }
}

/// Cloneable handle to a running session.
///
/// Methods that talk to the orchestration task fail with
/// `Error::Destroyed` once the session has shut down.
#[derive(Clone)]
pub struct SessionHandle {
    local_id: watch::Receiver<PeerId>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    errors: broadcast::Sender<ErrorReport>,
    store: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("local_id", &*self.local_id.borrow())
            .field("closed", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Id the endpoint is registered under. Changes if the session has to
    /// adopt a new identity.
    pub fn local_id(&self) -> PeerId {
        self.local_id.borrow().clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to surfaced errors.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorReport> {
        self.errors.subscribe()
    }

    /// Whether the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::Destroyed)?;
        response.await.map_err(|_| Error::Destroyed)
    }

    /// Open a link to `remote`. Connecting to a peer that is already
    /// linked is a no-op.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidPeerId` for a malformed id
    /// - `Error::InvalidInput` for our own id
    /// - `Error::PeerLimitReached` when the link limit is reached
    pub async fn connect(&self, remote: &str) -> Result<()> {
        let peer = PeerId::parse(remote)?;
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    /// Close the link to `peer` and forget it as a recent peer.
    ///
    /// # Errors
    ///
    /// Fails only if the session has shut down.
    pub async fn disconnect(&self, peer: &PeerId) -> Result<bool> {
        let peer = peer.clone();
        self.request(|reply| Command::Disconnect { peer, reply }).await
    }

    /// Close every link and clear the recent peers.
    ///
    /// # Errors
    ///
    /// Fails only if the session has shut down.
    pub async fn disconnect_all(&self) -> Result<Vec<PeerId>> {
        self.request(|reply| Command::DisconnectAll { reply }).await
    }

    /// Add a file to the send queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is missing or not a regular file.
    pub async fn queue_file(&self, path: impl Into<PathBuf>) -> Result<QueuedFile> {
        let path = path.into();
        self.request(|reply| Command::QueueFile { path, reply }).await?
    }

    /// Remove a file from the send queue.
    ///
    /// # Errors
    ///
    /// Fails only if the session has shut down.
    pub async fn remove_queued(&self, id: Uuid) -> Result<Option<QueuedFile>> {
        self.request(|reply| Command::RemoveQueued { id, reply }).await
    }

    /// Send every queued file to every handshaken peer. Returns the ids of
    /// the transfers started.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoRecipients` if no peer is connected; the queue is
    /// left untouched.
    pub async fn send_queue(&self) -> Result<Vec<Uuid>> {
        self.request(|reply| Command::SendQueue {
            recipients: None,
            reply,
        })
        .await?
    }

    /// Send every queued file to the listed peers. Peers without an open
    /// link are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoRecipients` if none of the peers is connected.
    pub async fn send_queue_to(&self, recipients: Vec<PeerId>) -> Result<Vec<Uuid>> {
        self.request(|reply| Command::SendQueue {
            recipients: Some(recipients),
            reply,
        })
        .await?
    }

    /// Send a chat message to every connected peer.
    ///
    /// # Errors
    ///
    /// Returns `Error::NoRecipients` if no link is open.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<ChatMessage> {
        let text = text.into();
        self.request(|reply| Command::SendChat { text, reply }).await?
    }

    /// Current session state.
    ///
    /// # Errors
    ///
    /// Fails only if the session has shut down.
    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Peers seen within the recent window.
    ///
    /// # Errors
    ///
    /// Fails only if the session has shut down.
    pub async fn recent_peers(&self) -> Result<Vec<RecentPeer>> {
        self.request(|reply| Command::RecentPeers { reply }).await
    }

    /// Forget all recent peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be saved.
    pub async fn clear_recent(&self) -> Result<()> {
        self.request(|reply| Command::ClearRecent { reply }).await?
    }

    /// Files in the blob store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn stored_files(&self) -> Result<Vec<StoredFile>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.list())
            .await
            .map_err(|e| Error::Internal(format!("store task failed: {e}")))?
    }

    /// Tear the session down: links close, the endpoint is released and
    /// timers stop. Shutting down twice is a no-op.
    ///
    /// # Errors
    ///
    /// This method currently always succeeds.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(Error::Destroyed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
