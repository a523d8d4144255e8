//! Transport link contract.
//!
//! The connection manager never talks to a network directly. It drives a
//! [`TransportLink`], which registers a named endpoint and opens reliable,
//! ordered point-to-point [`Channel`]s to other endpoints. Everything the
//! transport observes is reported back as events on unbounded channels:
//!
//! - [`EndpointEvent`] for the local endpoint (opened, incoming link,
//!   error, disconnected from signaling, closed)
//! - [`ChannelEvent`] for one channel (open, data, close, error)
//!
//! [`memory::MemoryNetwork`] implements the contract in-process and
//! [`tcp::TcpTransport`] over direct TCP streams.

pub mod memory;
pub mod tcp;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::identity::PeerId;
use crate::protocol::Frame;

/// Classification of a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Local id rejected as invalid or already taken
    Identity(String),
    /// Network, socket or signaling server hiccup
    Transient(String),
    /// Remote peer is not addressable
    Unreachable(PeerId),
    /// Anything else
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity(msg) => write!(f, "identity rejected: {msg}"),
            Self::Transient(msg) => write!(f, "transient: {msg}"),
            Self::Unreachable(peer) => write!(f, "peer {peer} unreachable"),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Negotiating
    Connecting,
    /// Frames can be sent
    Open,
    /// Closed by either side
    Closed,
}

/// Events observed on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Channel is ready for frames
    Open,
    /// A frame arrived
    Data(Frame),
    /// Channel closed
    Close,
    /// Channel failed
    Error(String),
}

/// Events observed on the local endpoint.
#[derive(Debug)]
pub enum EndpointEvent<C> {
    /// Endpoint registered under the given id
    Opened(PeerId),
    /// A remote peer opened a channel to us
    IncomingLink(ChannelLink<C>),
    /// Transport reported an error
    Error(TransportError),
    /// Lost the signaling connection; existing channels may survive
    Disconnected,
    /// Endpoint closed for good
    Closed,
}

/// A channel plus the stream of events it produces.
#[derive(Debug)]
pub struct ChannelLink<C> {
    /// The channel
    pub channel: C,
    /// Its events
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// One reliable, ordered, point-to-point channel.
pub trait Channel: Send + Sync + 'static {
    /// Peer on the other end.
    fn remote_id(&self) -> &PeerId;

    /// Current state.
    fn state(&self) -> ChannelState;

    /// Queue a frame for delivery. Frames are delivered in call order.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open or the frame cannot be
    /// encoded.
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

/// A transport that can register one local endpoint at a time.
pub trait TransportLink: Send + Sync + 'static {
    /// Channel type produced by this transport.
    type Channel: Channel;

    /// Register the local endpoint under `local_id`.
    ///
    /// The outcome arrives on the returned receiver: `Opened` on success,
    /// `Error(Identity)` if the id is invalid or taken.
    fn open(&self, local_id: &PeerId) -> mpsc::UnboundedReceiver<EndpointEvent<Self::Channel>>;

    /// Open a channel to `remote_id`.
    ///
    /// An unreachable peer is reported as `Error(Unreachable)` on the
    /// endpoint events.
    ///
    /// # Errors
    ///
    /// Returns an error if the local endpoint is not open.
    fn connect_channel(&self, remote_id: &PeerId) -> Result<ChannelLink<Self::Channel>>;

    /// Whether the endpoint has lost its signaling connection.
    fn is_disconnected(&self) -> bool;

    /// Try to restore the signaling connection. Success is reported as a
    /// fresh `Opened` event.
    fn reconnect(&self);

    /// Release the endpoint.
    fn destroy(&self);
}
