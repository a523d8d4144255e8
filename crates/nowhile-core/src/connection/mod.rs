//! Peer link registry and endpoint supervision.
//!
//! [`ConnectionManager`] owns every link to a remote peer and the local
//! endpoint registration with the [`TransportLink`]. It is driven by the
//! session's orchestration task:
//!
//! ```text
//! transport events ──► pumps ──► ManagerInput queue ──► next_input()
//!                                                          │
//!                                   handle_input() ◄───────┘
//!                                         │
//!                                         ▼
//!                                   ManagerEvent
//! ```
//!
//! ## Supervision
//!
//! - Identity errors fail [`ConnectionManager::initialize`] and are never
//!   retried here; the session decides whether to retry or regenerate.
//! - Network and signaling errors start the reconnection loop: one
//!   immediate attempt, then one attempt per `reconnect_interval` until the
//!   endpoint is back or the manager is destroyed. The interval is fixed
//!   rather than backing off, which keeps recovery time predictable.
//! - An unreachable peer fails only that connect attempt.
//! - If the transport closes the endpoint, it is re-opened under the same
//!   id after `reopen_delay`. A re-open that keeps being refused is retried
//!   `identity_attempts` times `identity_retry_delay` apart and then
//!   reported as [`ManagerEvent::IdentityRejected`]; picking a new id is
//!   the session's call.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::protocol::{Frame, PeerInfo};
use crate::transfer::FrameSender;
use crate::transport::{
    Channel, ChannelEvent, ChannelLink, ChannelState, EndpointEvent, TransportError, TransportLink,
};

/// Capacity of the connection-changed broadcast channel.
const CHANGE_BUS_CAPACITY: usize = 64;

/// Lifecycle of the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not registered yet
    Uninitialized,
    /// Registration in flight
    Initializing,
    /// Registered, no open links
    Open,
    /// Registered with one or more open links
    Linked,
    /// Lost the signaling connection; reconnecting
    Disconnected,
    /// Torn down for good
    Destroyed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Open => write!(f, "Open"),
            Self::Linked => write!(f, "Linked"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// A handshaken peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerLink {
    /// Peer id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// Operating system
    pub os: String,
    /// Client software
    pub client: String,
    /// When the link was established
    pub connected_at: DateTime<Utc>,
    /// Whether the peer reports a secure transport
    pub is_secure: bool,
}

impl From<PeerInfo> for PeerLink {
    fn from(info: PeerInfo) -> Self {
        Self {
            id: info.id,
            name: info.name,
            os: info.os,
            client: info.client,
            connected_at: info.connected_at,
            is_secure: info.is_secure,
        }
    }
}

/// Link open/close notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChanged {
    /// Peer whose link changed
    pub peer: PeerId,
    /// Whether the link is now open
    pub connected: bool,
}

/// Outcome of handling one [`ManagerInput`].
#[derive(Debug)]
pub enum ManagerEvent {
    /// Endpoint registered or reconnected
    EndpointOpened(PeerId),
    /// Endpoint lost signaling or was closed; recovery is under way
    EndpointDisconnected,
    /// The transport keeps refusing the local id while re-opening. The
    /// endpoint is released; links stay up until the caller registers a
    /// new id with [`ConnectionManager::reopen_as`].
    IdentityRejected(PeerId),
    /// A link finished opening
    LinkOpened(PeerId),
    /// A link went away
    LinkClosed {
        /// Peer on the other end
        peer: PeerId,
        /// Whether the link had opened
        was_open: bool,
        /// Failure reason, if the channel errored
        reason: Option<String>,
    },
    /// A frame arrived
    Frame {
        /// Sender
        from: PeerId,
        /// The frame
        frame: Frame,
    },
    /// An error to surface
    Failed(Error),
}

enum Input<C> {
    Endpoint {
        generation: u64,
        event: EndpointEvent<C>,
    },
    Link {
        peer: PeerId,
        serial: u64,
        event: ChannelEvent,
    },
    RetryTick,
    Reopen {
        generation: u64,
    },
}

/// Something for the manager to react to. Obtain with
/// [`ConnectionManager::next_input`], feed back with
/// [`ConnectionManager::handle_input`].
pub struct ManagerInput<C>(Input<C>);

type InputSender<C> = mpsc::UnboundedSender<ManagerInput<C>>;

struct LinkEntry<C> {
    serial: u64,
    channel: C,
    opened: bool,
    peer: Option<PeerLink>,
    pump: JoinHandle<()>,
}

impl<C: Channel> LinkEntry<C> {
    fn is_live(&self) -> bool {
        self.channel.state() != ChannelState::Closed
    }

    fn is_sendable(&self) -> bool {
        self.opened && self.channel.state() == ChannelState::Open
    }

    fn shutdown(self) {
        self.pump.abort();
        self.channel.close();
    }
}

struct RetryTimer {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RetryTimer {
    fn start<C: Send + 'static>(period: Duration, tx: InputSender<C>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if tx.send(ManagerInput(Input::RetryTick)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.abort();
    }
}

/// Owner of all peer links and the local endpoint.
pub struct ConnectionManager<T: TransportLink> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    local_id: Option<PeerId>,
    generation: u64,
    next_serial: u64,
    links: HashMap<PeerId, LinkEntry<T::Channel>>,
    inputs_tx: InputSender<T::Channel>,
    inputs_rx: mpsc::UnboundedReceiver<ManagerInput<T::Channel>>,
    deferred: VecDeque<ManagerInput<T::Channel>>,
    endpoint_pump: Option<JoinHandle<()>>,
    retry: Option<RetryTimer>,
    reopen: Option<JoinHandle<()>>,
    reopen_refusals: u32,
    changes: broadcast::Sender<ConnectionChanged>,
}

impl<T: TransportLink> ConnectionManager<T> {
    /// Create a manager over `transport`. Nothing is registered until
    /// [`initialize`](Self::initialize) is called.
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_BUS_CAPACITY);

        Self {
            transport,
            config,
            state: ConnectionState::Uninitialized,
            local_id: None,
            generation: 0,
            next_serial: 0,
            links: HashMap::new(),
            inputs_tx,
            inputs_rx,
            deferred: VecDeque::new(),
            endpoint_pump: None,
            retry: None,
            reopen: None,
            reopen_refusals: 0,
            changes,
        }
    }

    /// Current endpoint state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Id the endpoint is registered under.
    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Subscribe to link open/close notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionChanged> {
        self.changes.subscribe()
    }

    /// Whether a reconnection timer is running.
    pub fn is_reconnecting(&self) -> bool {
        self.retry.is_some()
    }

    /// Register the local endpoint under `local_id` and wait until the
    /// transport confirms it.
    ///
    /// A no-op if already registered under the same id. Registering under a
    /// different id releases the previous endpoint first.
    ///
    /// # Errors
    ///
    /// - `Error::IdentityConflict` if the transport rejects the id
    /// - `Error::TransportTransient` if the transport kept reporting
    ///   network trouble until `open_timeout` ran out
    /// - `Error::Timeout` if the transport does not answer within
    ///   `open_timeout`
    /// - `Error::Destroyed` after [`destroy`](Self::destroy)
    pub async fn initialize(&mut self, local_id: PeerId) -> Result<()> {
        if self.state == ConnectionState::Destroyed {
            return Err(Error::Destroyed);
        }

        if self.local_id.as_ref() == Some(&local_id)
            && matches!(
                self.state,
                ConnectionState::Open | ConnectionState::Linked | ConnectionState::Disconnected
            )
        {
            return Ok(());
        }

        if self.local_id.is_some() {
            self.release_endpoint();
        }

        tracing::info!(id = %local_id, "Registering local endpoint");
        self.state = ConnectionState::Initializing;
        self.local_id = Some(local_id.clone());
        self.open_endpoint(&local_id);

        let deadline = Instant::now() + self.config.open_timeout;
        let mut last_transient = None;
        loop {
            let input = match tokio::time::timeout_at(deadline, self.inputs_rx.recv()).await {
                Ok(Some(input)) => input,
                Ok(None) => return Err(Error::Internal("manager input queue closed".into())),
                Err(_) => {
                    self.abandon_registration();
                    return Err(match last_transient {
                        Some(reason) => Error::TransportTransient(reason),
                        None => Error::Timeout(self.config.open_timeout.as_secs()),
                    });
                }
            };

            let (generation, event) = match input {
                ManagerInput(Input::Endpoint { generation, event }) => (generation, event),
                ManagerInput(Input::Reopen { generation }) if generation == self.generation => {
                    self.reopen = None;
                    tracing::debug!(id = %local_id, "Retrying registration");
                    self.open_endpoint(&local_id);
                    continue;
                }
                other => {
                    self.deferred.push_back(other);
                    continue;
                }
            };
            if generation != self.generation {
                continue;
            }

            match event {
                EndpointEvent::Opened(id) => {
                    self.state = ConnectionState::Open;
                    tracing::info!(id = %id, "Local endpoint open");
                    return Ok(());
                }
                EndpointEvent::Error(TransportError::Identity(msg)) => {
                    tracing::warn!(id = %local_id, reason = %msg, "Local id rejected");
                    self.abandon_registration();
                    return Err(Error::IdentityConflict(local_id.to_string()));
                }
                EndpointEvent::Error(TransportError::Transient(msg)) => {
                    tracing::debug!(reason = %msg, "Transient error during registration");
                    last_transient = Some(msg);
                    self.schedule_reopen(self.config.reopen_delay);
                }
                EndpointEvent::Error(other) => {
                    self.abandon_registration();
                    return Err(Error::Transport(other.to_string()));
                }
                EndpointEvent::Closed => {
                    self.abandon_registration();
                    return Err(Error::Transport(
                        "endpoint closed during registration".into(),
                    ));
                }
                EndpointEvent::Disconnected => {}
                event @ EndpointEvent::IncomingLink(_) => {
                    self.deferred
                        .push_back(ManagerInput(Input::Endpoint { generation, event }));
                }
            }
        }
    }

    /// Wait for the next input. Cancel safe.
    pub async fn next_input(&mut self) -> Option<ManagerInput<T::Channel>> {
        if let Some(input) = self.deferred.pop_front() {
            return Some(input);
        }
        self.inputs_rx.recv().await
    }

    /// React to one input. After [`destroy`](Self::destroy) every input is
    /// ignored.
    pub fn handle_input(&mut self, input: ManagerInput<T::Channel>) -> Option<ManagerEvent> {
        if self.state == ConnectionState::Destroyed {
            return None;
        }

        match input.0 {
            Input::Endpoint { generation, event } => {
                if generation != self.generation {
                    tracing::debug!(generation, "Ignoring event from released endpoint");
                    return None;
                }
                self.on_endpoint_event(event)
            }
            Input::Link {
                peer,
                serial,
                event,
            } => self.on_link_event(peer, serial, event),
            Input::RetryTick => {
                self.on_retry_tick();
                None
            }
            Input::Reopen { generation } => {
                self.reopen = None;
                if generation == self.generation {
                    self.reopen_endpoint();
                }
                None
            }
        }
    }

    /// Open a link to `remote_id`.
    ///
    /// Idempotent: a live link (opening or open) makes this a no-op, and a
    /// closed record is replaced. Completion is observed as
    /// [`ManagerEvent::LinkOpened`]; an unreachable peer as
    /// [`ManagerEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Fails if the manager is destroyed or not initialized, the id is our
    /// own, or the peer limit is reached.
    pub fn connect(&mut self, remote_id: &PeerId) -> Result<()> {
        if self.state == ConnectionState::Destroyed {
            return Err(Error::Destroyed);
        }
        let local_id = self.local_id.clone().ok_or(Error::NotInitialized)?;
        if remote_id == &local_id {
            return Err(Error::InvalidInput("cannot connect to yourself".into()));
        }

        if let Some(entry) = self.links.get(remote_id) {
            if entry.is_live() {
                tracing::debug!(peer = %remote_id, "Link already exists");
                return Ok(());
            }
            if let Some(stale) = self.links.remove(remote_id) {
                tracing::debug!(peer = %remote_id, "Replacing closed link");
                stale.shutdown();
            }
        }

        if self.links.len() >= self.config.max_peers {
            return Err(Error::PeerLimitReached(self.config.max_peers));
        }

        if self.transport.is_disconnected() {
            self.start_reconnect();
        }

        tracing::info!(peer = %remote_id, "Connecting");
        let link = self.transport.connect_channel(remote_id)?;
        self.register(remote_id.clone(), link, None);
        Ok(())
    }

    /// Send a frame to one peer over an open link. Frames for links that
    /// are missing or not yet open are dropped.
    pub fn send_to(&self, peer: &PeerId, frame: &Frame) -> bool {
        if self.state == ConnectionState::Destroyed {
            return false;
        }

        match self.links.get(peer) {
            Some(entry) if entry.is_sendable() => match entry.channel.send(frame) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Send failed");
                    false
                }
            },
            _ => {
                tracing::debug!(peer = %peer, frame = %frame.frame_type(), "Dropping frame for link that is not open");
                false
            }
        }
    }

    /// Send a frame to every open link. Returns how many accepted it.
    pub fn send_to_all(&self, frame: &Frame) -> usize {
        self.links
            .keys()
            .filter(|peer| self.send_to(peer, frame))
            .count()
    }

    /// Record the peer information from a handshake. Repeated handshakes
    /// update the existing entry.
    pub fn apply_handshake(&mut self, from: &PeerId, info: PeerInfo) -> Option<PeerLink> {
        let entry = self.links.get_mut(from)?;
        if &info.id != from {
            tracing::warn!(peer = %from, claimed = %info.id, "Handshake id does not match link");
        }

        let mut link = PeerLink::from(info);
        link.id = from.clone();
        if let Some(existing) = &entry.peer {
            tracing::debug!(peer = %from, "Updating peer details");
            link.connected_at = existing.connected_at;
        }
        entry.peer = Some(link.clone());
        Some(link)
    }

    /// Handshaken peers with an open link.
    pub fn peers(&self) -> Vec<PeerLink> {
        let mut peers: Vec<PeerLink> = self
            .links
            .values()
            .filter(|entry| entry.is_sendable())
            .filter_map(|entry| entry.peer.clone())
            .collect();
        peers.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        peers
    }

    /// Details of one handshaken peer.
    pub fn peer(&self, id: &PeerId) -> Option<&PeerLink> {
        self.links.get(id).and_then(|entry| entry.peer.as_ref())
    }

    /// Whether `peer` has an open link.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.links.get(peer).is_some_and(LinkEntry::is_sendable)
    }

    /// Number of links in the registry, open or opening.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Close and forget the link to `peer`.
    ///
    /// Returns `None` if there was no link, otherwise whether it had
    /// opened. Only links that had opened are announced as closed.
    pub fn disconnect_peer(&mut self, peer: &PeerId) -> Option<bool> {
        let entry = self.links.remove(peer)?;
        let was_open = entry.opened;

        tracing::info!(peer = %peer, "Disconnecting");
        entry.shutdown();
        self.refresh_state();
        if was_open {
            let _ = self.changes.send(ConnectionChanged {
                peer: peer.clone(),
                connected: false,
            });
        }
        Some(was_open)
    }

    /// Close every link, keeping the endpoint registered. Returns each
    /// peer with whether its link had opened.
    pub fn disconnect_all(&mut self) -> Vec<(PeerId, bool)> {
        let peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers
            .into_iter()
            .filter_map(|peer| {
                let was_open = self.disconnect_peer(&peer)?;
                Some((peer, was_open))
            })
            .collect()
    }

    /// Register the endpoint under a new id without waiting for the
    /// outcome, which arrives through [`handle_input`](Self::handle_input).
    /// Existing links are kept.
    ///
    /// # Errors
    ///
    /// Returns `Error::Destroyed` after [`destroy`](Self::destroy).
    pub fn reopen_as(&mut self, local_id: PeerId) -> Result<()> {
        if self.state == ConnectionState::Destroyed {
            return Err(Error::Destroyed);
        }

        self.stop_retry();
        if let Some(reopen) = self.reopen.take() {
            reopen.abort();
        }
        self.reopen_refusals = 0;
        self.local_id = Some(local_id.clone());
        self.reopen_endpoint();
        Ok(())
    }

    /// Tear everything down. Terminal: timers stop, links close, the
    /// endpoint is released, and later inputs are ignored.
    pub fn destroy(&mut self) {
        if self.state == ConnectionState::Destroyed {
            return;
        }

        tracing::info!("Destroying connection manager");
        self.state = ConnectionState::Destroyed;
        self.stop_retry();
        if let Some(reopen) = self.reopen.take() {
            reopen.abort();
        }
        for (_, entry) in self.links.drain() {
            entry.shutdown();
        }
        if let Some(pump) = self.endpoint_pump.take() {
            pump.abort();
        }
        self.deferred.clear();
        self.transport.destroy();
    }

    fn open_endpoint(&mut self, local_id: &PeerId) {
        self.generation += 1;
        if let Some(pump) = self.endpoint_pump.take() {
            pump.abort();
        }

        let mut events = self.transport.open(local_id);
        let tx = self.inputs_tx.clone();
        let generation = self.generation;
        self.endpoint_pump = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx
                    .send(ManagerInput(Input::Endpoint { generation, event }))
                    .is_err()
                {
                    break;
                }
            }
        }));
    }

    fn abandon_registration(&mut self) {
        self.release_endpoint();
        self.state = ConnectionState::Uninitialized;
        self.local_id = None;
    }

    fn release_endpoint(&mut self) {
        self.stop_retry();
        if let Some(reopen) = self.reopen.take() {
            reopen.abort();
        }
        for (_, entry) in self.links.drain() {
            entry.shutdown();
        }
        if let Some(pump) = self.endpoint_pump.take() {
            pump.abort();
        }
        self.generation += 1;
        self.transport.destroy();
    }

    fn reopen_endpoint(&mut self) {
        let Some(local_id) = self.local_id.clone() else {
            return;
        };
        tracing::info!(id = %local_id, "Re-opening local endpoint");
        self.state = ConnectionState::Initializing;
        self.open_endpoint(&local_id);
    }

    fn register(&mut self, peer: PeerId, link: ChannelLink<T::Channel>, known: Option<PeerLink>) {
        self.next_serial += 1;
        let serial = self.next_serial;
        let ChannelLink { channel, mut events } = link;

        let tx = self.inputs_tx.clone();
        let pump_peer = peer.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let input = Input::Link {
                    peer: pump_peer.clone(),
                    serial,
                    event,
                };
                if tx.send(ManagerInput(input)).is_err() {
                    break;
                }
            }
        });

        self.links.insert(
            peer,
            LinkEntry {
                serial,
                channel,
                opened: false,
                peer: known,
                pump,
            },
        );
    }

    fn accept_incoming(&mut self, link: ChannelLink<T::Channel>) -> Option<ManagerEvent> {
        let peer = link.channel.remote_id().clone();
        let mut known = None;
        let mut replaced_open = false;

        if let Some(existing) = self.links.get(&peer) {
            // Both sides dialled at once: keep the channel opened by the lower id.
            let incoming_wins = self.local_id.as_ref().is_some_and(|local| &peer < local);
            if existing.is_live() && !incoming_wins {
                tracing::debug!(peer = %peer, "Declining duplicate incoming link");
                link.channel.close();
                return None;
            }
            if let Some(replaced) = self.links.remove(&peer) {
                tracing::debug!(peer = %peer, "Incoming link replaces existing one");
                known = replaced.peer.clone();
                replaced_open = replaced.opened;
                replaced.shutdown();
            }
        }

        tracing::info!(peer = %peer, "Incoming link");
        self.register(peer.clone(), link, known);
        self.refresh_state();

        if !replaced_open {
            return None;
        }
        let _ = self.changes.send(ConnectionChanged {
            peer: peer.clone(),
            connected: false,
        });
        Some(ManagerEvent::LinkClosed {
            peer,
            was_open: true,
            reason: None,
        })
    }

    fn on_endpoint_event(&mut self, event: EndpointEvent<T::Channel>) -> Option<ManagerEvent> {
        match event {
            EndpointEvent::Opened(id) => {
                if self.state == ConnectionState::Disconnected {
                    tracing::info!(id = %id, "Reconnected to signaling");
                }
                self.reopen_refusals = 0;
                self.stop_retry();
                self.state = ConnectionState::Open;
                self.refresh_state();
                Some(ManagerEvent::EndpointOpened(id))
            }
            EndpointEvent::IncomingLink(link) => self.accept_incoming(link),
            EndpointEvent::Error(error) => self.on_transport_error(error),
            EndpointEvent::Disconnected => {
                tracing::warn!("Lost signaling connection");
                self.state = ConnectionState::Disconnected;
                self.start_reconnect();
                Some(ManagerEvent::EndpointDisconnected)
            }
            EndpointEvent::Closed => {
                tracing::warn!(delay = ?self.config.reopen_delay, "Local endpoint closed");
                self.state = ConnectionState::Disconnected;
                self.schedule_reopen(self.config.reopen_delay);
                Some(ManagerEvent::EndpointDisconnected)
            }
        }
    }

    fn on_transport_error(&mut self, error: TransportError) -> Option<ManagerEvent> {
        match error {
            TransportError::Identity(msg) => {
                tracing::warn!(reason = %msg, "Identity rejected by transport");
                let id = self.local_id.clone()?;
                if self.state != ConnectionState::Initializing {
                    return Some(ManagerEvent::Failed(Error::IdentityConflict(id.to_string())));
                }

                self.reopen_refusals += 1;
                if self.reopen_refusals < self.config.identity_attempts {
                    self.schedule_reopen(self.config.identity_retry_delay);
                    return None;
                }

                tracing::warn!(id = %id, attempts = self.reopen_refusals, "Giving up on local id");
                self.reopen_refusals = 0;
                if let Some(pump) = self.endpoint_pump.take() {
                    pump.abort();
                }
                self.generation += 1;
                self.state = ConnectionState::Uninitialized;
                Some(ManagerEvent::IdentityRejected(id))
            }
            TransportError::Transient(msg) => {
                tracing::warn!(reason = %msg, "Transient transport error");
                if self.state == ConnectionState::Initializing {
                    self.schedule_reopen(self.config.reopen_delay);
                } else {
                    self.start_reconnect();
                }
                None
            }
            TransportError::Unreachable(peer) => {
                let pending = self
                    .links
                    .get(&peer)
                    .is_some_and(|entry| !entry.opened);
                if pending {
                    if let Some(entry) = self.links.remove(&peer) {
                        entry.shutdown();
                    }
                    self.refresh_state();
                }
                tracing::warn!(peer = %peer, "Peer unreachable");
                Some(ManagerEvent::Failed(Error::PeerUnreachable(peer)))
            }
            TransportError::Other(msg) => {
                tracing::warn!(reason = %msg, "Transport error");
                Some(ManagerEvent::Failed(Error::Transport(msg)))
            }
        }
    }

    fn on_link_event(
        &mut self,
        peer: PeerId,
        serial: u64,
        event: ChannelEvent,
    ) -> Option<ManagerEvent> {
        let entry = self.links.get_mut(&peer)?;
        if entry.serial != serial {
            tracing::debug!(peer = %peer, "Ignoring event from replaced link");
            return None;
        }

        match event {
            ChannelEvent::Open => {
                if entry.opened {
                    return None;
                }
                entry.opened = true;
                self.refresh_state();
                tracing::info!(peer = %peer, "Link open");
                let _ = self.changes.send(ConnectionChanged {
                    peer: peer.clone(),
                    connected: true,
                });
                Some(ManagerEvent::LinkOpened(peer))
            }
            ChannelEvent::Data(frame) => Some(ManagerEvent::Frame { from: peer, frame }),
            ChannelEvent::Close => self.drop_link(peer, None),
            ChannelEvent::Error(reason) => {
                tracing::warn!(peer = %peer, reason = %reason, "Link failed");
                self.drop_link(peer, Some(reason))
            }
        }
    }

    fn drop_link(&mut self, peer: PeerId, reason: Option<String>) -> Option<ManagerEvent> {
        let entry = self.links.remove(&peer)?;
        let was_open = entry.opened;
        entry.shutdown();
        self.refresh_state();

        if was_open {
            tracing::info!(peer = %peer, "Link closed");
            let _ = self.changes.send(ConnectionChanged {
                peer: peer.clone(),
                connected: false,
            });
        }

        Some(ManagerEvent::LinkClosed {
            peer,
            was_open,
            reason,
        })
    }

    fn refresh_state(&mut self) {
        let any_open = self.links.values().any(|entry| entry.opened);
        self.state = match self.state {
            ConnectionState::Open if any_open => ConnectionState::Linked,
            ConnectionState::Linked if !any_open => ConnectionState::Open,
            state => state,
        };
    }

    fn start_reconnect(&mut self) {
        if self.state == ConnectionState::Destroyed || self.retry.is_some() {
            return;
        }
        if !self.transport.is_disconnected() {
            return;
        }

        tracing::info!(interval = ?self.config.reconnect_interval, "Reconnecting to signaling");
        self.transport.reconnect();
        self.retry = Some(RetryTimer::start(
            self.config.reconnect_interval,
            self.inputs_tx.clone(),
        ));
    }

    fn on_retry_tick(&mut self) {
        if self.retry.is_none() {
            return;
        }
        if !self.transport.is_disconnected() {
            self.stop_retry();
            return;
        }

        tracing::debug!("Retrying signaling connection");
        self.transport.reconnect();
    }

    fn stop_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.stop();
        }
    }

    fn schedule_reopen(&mut self, delay: Duration) {
        if self.state == ConnectionState::Destroyed || self.reopen.is_some() {
            return;
        }

        let generation = self.generation;
        let tx = self.inputs_tx.clone();
        self.reopen = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ManagerInput(Input::Reopen { generation }));
        }));
    }
}

impl<T: TransportLink> FrameSender for ConnectionManager<T> {
    fn send_frame(&self, peer: &PeerId, frame: &Frame) -> bool {
        self.send_to(peer, frame)
    }
}

impl<T: TransportLink> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.stop_retry();
        if let Some(reopen) = self.reopen.take() {
            reopen.abort();
        }
        if let Some(pump) = self.endpoint_pump.take() {
            pump.abort();
        }
        for entry in self.links.values() {
            entry.pump.abort();
        }
    }
}
