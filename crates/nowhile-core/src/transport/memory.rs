//! In-process transport network.
//!
//! [`MemoryNetwork`] plays the role of a signaling server plus the direct
//! channels between peers. Every frame crosses the wire as encoded bytes
//! and is decoded on the receiving side, so the codec is exercised exactly
//! as it would be over a real transport.
//!
//! Fault injection hooks let callers reproduce the situations the
//! connection manager has to survive: ids that are already taken, lost
//! signaling, endpoints closing underneath us and channels failing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use super::{
    Channel, ChannelEvent, ChannelLink, ChannelState, EndpointEvent, TransportError, TransportLink,
};
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::protocol::{decode_frame, encode_frame, Frame};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type EndpointSender = mpsc::UnboundedSender<EndpointEvent<MemoryChannel>>;

struct EndpointSlot {
    handle: u64,
    events: EndpointSender,
    disconnected: bool,
}

struct WireState {
    state: ChannelState,
    ends: [Option<mpsc::UnboundedSender<ChannelEvent>>; 2],
}

impl WireState {
    fn shut(&mut self, last: &ChannelEvent) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.state = ChannelState::Closed;
        for end in &mut self.ends {
            if let Some(tx) = end.take() {
                let _ = tx.send(last.clone());
            }
        }
    }
}

struct WireEntry {
    peers: (PeerId, PeerId),
    wire: Weak<Mutex<WireState>>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<PeerId, EndpointSlot>,
    reserved: HashSet<PeerId>,
    blocked: HashSet<PeerId>,
    open_attempts: HashMap<PeerId, u32>,
    reconnect_attempts: HashMap<PeerId, u32>,
    wires: Vec<WireEntry>,
}

impl NetworkInner {
    fn live_wires(&mut self) -> Vec<(PeerId, PeerId, Arc<Mutex<WireState>>)> {
        self.wires.retain(|w| w.wire.strong_count() > 0);
        self.wires
            .iter()
            .filter_map(|w| {
                w.wire
                    .upgrade()
                    .map(|wire| (w.peers.0.clone(), w.peers.1.clone(), wire))
            })
            .collect()
    }
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
    next_handle: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport handle attached to this network.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            handle: self.next_handle.fetch_add(1, Ordering::Relaxed),
            local: Mutex::new(None),
        }
    }

    /// Mark `id` as held by someone outside this process.
    pub fn reserve(&self, id: &PeerId) {
        lock(&self.inner).reserved.insert(id.clone());
    }

    /// Release an id previously passed to [`reserve`](Self::reserve).
    pub fn release(&self, id: &PeerId) {
        lock(&self.inner).reserved.remove(id);
    }

    /// Cut the signaling connection of `id`. Reconnect attempts and new
    /// registrations fail until
    /// [`restore_signaling`](Self::restore_signaling) is called.
    pub fn drop_signaling(&self, id: &PeerId) {
        let mut inner = lock(&self.inner);
        inner.blocked.insert(id.clone());
        if let Some(slot) = inner.endpoints.get_mut(id) {
            slot.disconnected = true;
            let _ = slot.events.send(EndpointEvent::Disconnected);
        }
    }

    /// Let reconnect attempts for `id` succeed again.
    pub fn restore_signaling(&self, id: &PeerId) {
        lock(&self.inner).blocked.remove(id);
    }

    /// Report a transport error on the endpoint registered as `id`.
    pub fn inject_error(&self, id: &PeerId, error: TransportError) {
        let inner = lock(&self.inner);
        if let Some(slot) = inner.endpoints.get(id) {
            let _ = slot.events.send(EndpointEvent::Error(error));
        }
    }

    /// Close the endpoint registered as `id` as if the transport shut it.
    pub fn close_endpoint(&self, id: &PeerId) {
        let mut inner = lock(&self.inner);
        if let Some(slot) = inner.endpoints.remove(id) {
            let _ = slot.events.send(EndpointEvent::Closed);
        }
    }

    /// Fail every channel between `a` and `b`.
    pub fn sever(&self, a: &PeerId, b: &PeerId, reason: &str) {
        let wires = lock(&self.inner).live_wires();
        for (x, y, wire) in wires {
            if (&x == a && &y == b) || (&x == b && &y == a) {
                lock(&wire).shut(&ChannelEvent::Error(reason.to_string()));
            }
        }
    }

    /// Whether an endpoint is currently registered under `id`.
    #[must_use]
    pub fn is_registered(&self, id: &PeerId) -> bool {
        lock(&self.inner).endpoints.contains_key(id)
    }

    /// Number of `open` calls made for `id`.
    #[must_use]
    pub fn open_attempts(&self, id: &PeerId) -> u32 {
        lock(&self.inner).open_attempts.get(id).copied().unwrap_or(0)
    }

    /// Number of `reconnect` calls made for `id`.
    #[must_use]
    pub fn reconnect_attempts(&self, id: &PeerId) -> u32 {
        lock(&self.inner)
            .reconnect_attempts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of channels between `a` and `b` that are not closed.
    #[must_use]
    pub fn open_channels_between(&self, a: &PeerId, b: &PeerId) -> usize {
        let wires = lock(&self.inner).live_wires();
        wires
            .into_iter()
            .filter(|(x, y, _)| (x == a && y == b) || (x == b && y == a))
            .filter(|(_, _, wire)| lock(wire).state != ChannelState::Closed)
            .count()
    }
}

/// One endpoint's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    handle: u64,
    local: Mutex<Option<PeerId>>,
}

impl MemoryTransport {
    fn local_id(&self) -> Option<PeerId> {
        lock(&self.local).clone()
    }
}

impl TransportLink for MemoryTransport {
    type Channel = MemoryChannel;

    fn open(&self, local_id: &PeerId) -> mpsc::UnboundedReceiver<EndpointEvent<MemoryChannel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.network.inner);
        *inner.open_attempts.entry(local_id.clone()).or_default() += 1;

        let taken = inner.reserved.contains(local_id)
            || inner
                .endpoints
                .get(local_id)
                .is_some_and(|slot| slot.handle != self.handle);
        if taken {
            let _ = tx.send(EndpointEvent::Error(TransportError::Identity(format!(
                "ID \"{local_id}\" is taken"
            ))));
            return rx;
        }
        if inner.blocked.contains(local_id) {
            let _ = tx.send(EndpointEvent::Error(TransportError::Transient(
                "signaling server unreachable".to_string(),
            )));
            return rx;
        }

        let mut local = lock(&self.local);
        if let Some(previous) = local.take() {
            if inner
                .endpoints
                .get(&previous)
                .is_some_and(|slot| slot.handle == self.handle)
            {
                inner.endpoints.remove(&previous);
            }
        }

        inner.endpoints.insert(
            local_id.clone(),
            EndpointSlot {
                handle: self.handle,
                events: tx.clone(),
                disconnected: false,
            },
        );
        *local = Some(local_id.clone());
        let _ = tx.send(EndpointEvent::Opened(local_id.clone()));
        rx
    }

    fn connect_channel(&self, remote_id: &PeerId) -> Result<ChannelLink<MemoryChannel>> {
        let local_id = self.local_id().ok_or(Error::NotInitialized)?;
        let mut inner = lock(&self.network.inner);
        let own_events = inner
            .endpoints
            .get(&local_id)
            .filter(|slot| slot.handle == self.handle)
            .map(|slot| slot.events.clone())
            .ok_or(Error::NotInitialized)?;

        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let wire = Arc::new(Mutex::new(WireState {
            state: ChannelState::Connecting,
            ends: [Some(a_tx), Some(b_tx)],
        }));
        let local_end = MemoryChannel {
            remote: remote_id.clone(),
            wire: Arc::clone(&wire),
            side: 0,
        };

        let remote_events = inner
            .endpoints
            .get(remote_id)
            .filter(|slot| !slot.disconnected)
            .map(|slot| slot.events.clone());

        let Some(remote_events) = remote_events else {
            let mut state = lock(&wire);
            state.state = ChannelState::Closed;
            state.ends = [None, None];
            drop(state);
            let _ = own_events.send(EndpointEvent::Error(TransportError::Unreachable(
                remote_id.clone(),
            )));
            return Ok(ChannelLink {
                channel: local_end,
                events: a_rx,
            });
        };

        let remote_end = MemoryChannel {
            remote: local_id.clone(),
            wire: Arc::clone(&wire),
            side: 1,
        };

        {
            let mut state = lock(&wire);
            state.state = ChannelState::Open;
            for tx in state.ends.iter().flatten() {
                let _ = tx.send(ChannelEvent::Open);
            }
        }

        inner.wires.push(WireEntry {
            peers: (local_id, remote_id.clone()),
            wire: Arc::downgrade(&wire),
        });
        let _ = remote_events.send(EndpointEvent::IncomingLink(ChannelLink {
            channel: remote_end,
            events: b_rx,
        }));

        Ok(ChannelLink {
            channel: local_end,
            events: a_rx,
        })
    }

    fn is_disconnected(&self) -> bool {
        let Some(local_id) = self.local_id() else {
            return false;
        };
        lock(&self.network.inner)
            .endpoints
            .get(&local_id)
            .is_some_and(|slot| slot.handle == self.handle && slot.disconnected)
    }

    fn reconnect(&self) {
        let Some(local_id) = self.local_id() else {
            return;
        };
        let mut inner = lock(&self.network.inner);
        *inner
            .reconnect_attempts
            .entry(local_id.clone())
            .or_default() += 1;

        let blocked = inner.blocked.contains(&local_id);
        if let Some(slot) = inner.endpoints.get_mut(&local_id) {
            if slot.handle == self.handle && slot.disconnected && !blocked {
                slot.disconnected = false;
                let _ = slot.events.send(EndpointEvent::Opened(local_id));
            }
        }
    }

    fn destroy(&self) {
        let Some(local_id) = lock(&self.local).take() else {
            return;
        };
        let mut inner = lock(&self.network.inner);
        if inner
            .endpoints
            .get(&local_id)
            .is_some_and(|slot| slot.handle == self.handle)
        {
            inner.endpoints.remove(&local_id);
        }
        for (a, b, wire) in inner.live_wires() {
            if a == local_id || b == local_id {
                lock(&wire).shut(&ChannelEvent::Close);
            }
        }
    }
}

/// One end of an in-memory channel.
pub struct MemoryChannel {
    remote: PeerId,
    wire: Arc<Mutex<WireState>>,
    side: usize,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("remote", &self.remote)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}

impl Channel for MemoryChannel {
    fn remote_id(&self) -> &PeerId {
        &self.remote
    }

    fn state(&self) -> ChannelState {
        lock(&self.wire).state
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let bytes = encode_frame(frame)?;
        let state = lock(&self.wire);
        if state.state != ChannelState::Open {
            return Err(Error::Transport(format!(
                "channel to {} is not open",
                self.remote
            )));
        }

        let Some(other) = &state.ends[1 - self.side] else {
            return Err(Error::Transport("channel end dropped".to_string()));
        };
        let event = match decode_frame(&bytes) {
            Ok(frame) => ChannelEvent::Data(frame),
            Err(e) => ChannelEvent::Error(e.to_string()),
        };
        let _ = other.send(event);
        Ok(())
    }

    fn close(&self) {
        lock(&self.wire).shut(&ChannelEvent::Close);
    }
}
