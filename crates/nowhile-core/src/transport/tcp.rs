//! Direct TCP transport.
//!
//! Each endpoint listens on one socket and dials peers at addresses it has
//! been told about with [`TcpTransport::add_peer`]; there is no signaling
//! server, so the endpoint never reports `Disconnected`. A dialer opens the
//! stream with its six-character peer id, after which both directions carry
//! frames written with [`write_frame`] and read with [`read_frame`].
//!
//! Every channel runs one task that owns the socket. Sends are queued to
//! that task, so [`Channel::send`] never blocks and frames leave in call
//! order.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{
    Channel, ChannelEvent, ChannelLink, ChannelState, EndpointEvent, TransportError, TransportLink,
};
use crate::error::{Error, Result};
use crate::identity::{PeerId, PEER_ID_LENGTH};
use crate::protocol::{read_frame, write_frame, Frame};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 52531;

/// How long a dial may take before the peer counts as unreachable.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted stream has to name its peer id.
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a destroyed transport keeps flushing queued frames.
pub const CLOSE_LINGER: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Configure TCP keep-alive on a socket.
///
/// Idle links are checked after 10 seconds and then every 5 seconds, so a
/// peer that vanished without closing is noticed within half a minute.
fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(io::Error::other(e)))?;

    Ok(())
}

type EndpointSender = mpsc::UnboundedSender<EndpointEvent<TcpChannel>>;

struct Endpoint {
    id: PeerId,
    events: EndpointSender,
    cancel: CancellationToken,
}

/// A transport that talks to peers over plain TCP.
pub struct TcpTransport {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    peers: Mutex<HashMap<PeerId, SocketAddr>>,
    endpoint: Mutex<Option<Endpoint>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl TcpTransport {
    /// Bind the listening socket. Port 0 picks a free port; read it back
    /// with [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(addr = %local_addr, "TCP transport listening");

        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
            peers: Mutex::new(HashMap::new()),
            endpoint: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Register a peer id with the address to dial for it.
    #[must_use]
    pub fn with_peer(self, id: PeerId, addr: SocketAddr) -> Self {
        self.add_peer(id, addr);
        self
    }

    /// Register or update the address to dial for `id`.
    pub fn add_peer(&self, id: PeerId, addr: SocketAddr) {
        lock(&self.peers).insert(id, addr);
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves once the transport has been destroyed and every link has
    /// finished flushing. Take it before handing the transport to a session.
    pub fn finished(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let tasks = self.tasks.clone();
        async move { tasks.wait().await }
    }

    fn current_endpoint(&self) -> Option<(PeerId, EndpointSender)> {
        lock(&self.endpoint)
            .as_ref()
            .map(|endpoint| (endpoint.id.clone(), endpoint.events.clone()))
    }
}

impl TransportLink for TcpTransport {
    type Channel = TcpChannel;

    fn open(&self, local_id: &PeerId) -> mpsc::UnboundedReceiver<EndpointEvent<TcpChannel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shutdown.is_cancelled() {
            let _ = tx.send(EndpointEvent::Closed);
            return rx;
        }

        let cancel = self.shutdown.child_token();
        let previous = lock(&self.endpoint).replace(Endpoint {
            id: local_id.clone(),
            events: tx.clone(),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        self.tasks.spawn(accept_loop(
            Arc::clone(&self.listener),
            tx.clone(),
            cancel,
            self.shutdown.clone(),
            self.tasks.clone(),
        ));

        tracing::info!(peer_id = %local_id, addr = %self.local_addr, "TCP endpoint open");
        let _ = tx.send(EndpointEvent::Opened(local_id.clone()));
        rx
    }

    fn connect_channel(&self, remote_id: &PeerId) -> Result<ChannelLink<TcpChannel>> {
        let (local_id, endpoint_events) = self.current_endpoint().ok_or(Error::NotInitialized)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(ChannelShared::default()));
        let channel = TcpChannel {
            remote: remote_id.clone(),
            shared: Arc::clone(&shared),
        };

        let Some(addr) = lock(&self.peers).get(remote_id).copied() else {
            lock(&shared).shut();
            let _ = endpoint_events.send(EndpointEvent::Error(TransportError::Unreachable(
                remote_id.clone(),
            )));
            return Ok(ChannelLink {
                channel,
                events: events_rx,
            });
        };

        let remote = remote_id.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let dialed = tokio::select! {
                () = shutdown.cancelled() => return,
                dialed = timeout(DIAL_TIMEOUT, dial(addr, &local_id)) => dialed
                    .unwrap_or_else(|_| Err(Error::Timeout(DIAL_TIMEOUT.as_secs()))),
            };
            let stream = match dialed {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(peer = %remote, addr = %addr, error = %e, "Dial failed");
                    lock(&shared).shut();
                    let _ = endpoint_events
                        .send(EndpointEvent::Error(TransportError::Unreachable(remote)));
                    return;
                }
            };

            let outgoing = lock(&shared).open();
            if let Some(outgoing) = outgoing {
                run_channel(stream, remote, shared, events_tx, outgoing, shutdown).await;
            }
        });

        Ok(ChannelLink {
            channel,
            events: events_rx,
        })
    }

    fn is_disconnected(&self) -> bool {
        false
    }

    fn reconnect(&self) {}

    fn destroy(&self) {
        lock(&self.endpoint).take();
        self.shutdown.cancel();
        self.tasks.close();
    }
}

async fn dial(addr: SocketAddr, local_id: &PeerId) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    if let Err(e) = configure_tcp_keepalive(&stream) {
        tracing::debug!(error = %e, "Keep-alive not enabled");
    }
    stream.write_all(local_id.as_str().as_bytes()).await?;
    Ok(stream)
}

async fn read_preamble(stream: &mut TcpStream) -> Result<PeerId> {
    let mut buf = [0u8; PEER_ID_LENGTH];
    stream.read_exact(&mut buf).await?;
    let text = std::str::from_utf8(&buf)
        .map_err(|_| Error::ProtocolError("peer id is not UTF-8".to_string()))?;
    PeerId::parse(text)
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    events: EndpointSender,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (mut stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let events = events.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let remote = match timeout(PREAMBLE_TIMEOUT, read_preamble(&mut stream)).await {
                Ok(Ok(remote)) => remote,
                Ok(Err(e)) => {
                    tracing::debug!(addr = %addr, error = %e, "Rejected incoming stream");
                    return;
                }
                Err(_) => {
                    tracing::debug!(addr = %addr, "Incoming stream never named itself");
                    return;
                }
            };
            if let Err(e) = configure_tcp_keepalive(&stream) {
                tracing::debug!(error = %e, "Keep-alive not enabled");
            }
            tracing::debug!(peer = %remote, addr = %addr, "Accepted TCP link");

            let shared = Arc::new(Mutex::new(ChannelShared::default()));
            let Some(outgoing) = lock(&shared).open() else {
                return;
            };
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let link = ChannelLink {
                channel: TcpChannel {
                    remote: remote.clone(),
                    shared: Arc::clone(&shared),
                },
                events: events_rx,
            };
            if events.send(EndpointEvent::IncomingLink(link)).is_err() {
                return;
            }
            run_channel(stream, remote, shared, events_tx, outgoing, shutdown).await;
        });
    }
}

/// Drive one open stream until either side closes it or the transport is
/// destroyed. The final event is always `Close` or `Error`. Frames queued
/// before a local close or destroy are still written.
async fn run_channel(
    stream: TcpStream,
    remote: PeerId,
    shared: Arc<Mutex<ChannelShared>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    let _ = events.send(ChannelEvent::Open);

    let inbound = async {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    let _ = events.send(ChannelEvent::Data(frame));
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return ChannelEvent::Close;
                }
                Err(e) => return ChannelEvent::Error(e.to_string()),
            }
        }
    };

    let outbound = async {
        while let Some(frame) = outgoing.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                return ChannelEvent::Error(e.to_string());
            }
        }
        let _ = writer.shutdown().await;
        ChannelEvent::Close
    };

    tokio::pin!(outbound);

    let finished = tokio::select! {
        () = shutdown.cancelled() => None,
        last = inbound => Some(last),
        last = &mut outbound => Some(last),
    };
    let last = if let Some(last) = finished {
        last
    } else {
        lock(&shared).shut();
        let _ = timeout(CLOSE_LINGER, &mut outbound).await;
        ChannelEvent::Close
    };
    tracing::debug!(peer = %remote, event = ?last, "TCP link finished");
    lock(&shared).shut();
    let _ = events.send(last);
}

struct ChannelShared {
    state: ChannelState,
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
}

impl Default for ChannelShared {
    fn default() -> Self {
        Self {
            state: ChannelState::Connecting,
            outgoing: None,
        }
    }
}

impl ChannelShared {
    /// Move to `Open` and hand out the queue the socket task drains. `None`
    /// if the channel was closed while connecting.
    fn open(&mut self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        if self.state == ChannelState::Closed {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state = ChannelState::Open;
        self.outgoing = Some(tx);
        Some(rx)
    }

    /// Dropping the sender lets the socket task flush what is queued and
    /// then half-close the stream.
    fn shut(&mut self) {
        self.state = ChannelState::Closed;
        self.outgoing = None;
    }
}

/// One end of a TCP link.
pub struct TcpChannel {
    remote: PeerId,
    shared: Arc<Mutex<ChannelShared>>,
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel for TcpChannel {
    fn remote_id(&self) -> &PeerId {
        &self.remote
    }

    fn state(&self) -> ChannelState {
        lock(&self.shared).state
    }

    fn send(&self, frame: &Frame) -> Result<()> {
        let shared = lock(&self.shared);
        let Some(outgoing) = shared
            .outgoing
            .as_ref()
            .filter(|_| shared.state == ChannelState::Open)
        else {
            return Err(Error::Transport(format!(
                "channel to {} is not open",
                self.remote
            )));
        };
        outgoing
            .send(frame.clone())
            .map_err(|_| Error::Transport("channel task stopped".to_string()))
    }

    fn close(&self) {
        lock(&self.shared).shut();
    }
}
