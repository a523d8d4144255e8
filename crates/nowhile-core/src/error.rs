//! Error types for Nowhile.
//!
//! This module provides a unified error type for all Nowhile operations,
//! with specific error variants for different failure modes, plus the
//! cloneable [`ErrorReport`] published on a session's error bus.

use std::io;

use uuid::Uuid;

use thiserror::Error;

use crate::identity::PeerId;

/// A specialized `Result` type for Nowhile operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Nowhile.
#[derive(Error, Debug)]
pub enum Error {
    /// Local peer id rejected by the transport as invalid or taken (E101)
    #[error("peer id '{0}' is unavailable or invalid")]
    IdentityConflict(String),

    /// Identity regeneration exhausted without reaching the transport (E102)
    #[error("unable to register a local identity after {0} regenerations")]
    IdentityExhausted(u32),

    /// Network or signaling hiccup at the transport (E103)
    #[error("transport temporarily unavailable: {0}")]
    TransportTransient(String),

    /// Remote peer could not be reached (E104)
    #[error("peer {0} not found")]
    PeerUnreachable(PeerId),

    /// Established link failed (E105)
    #[error("link to {peer} lost: {reason}")]
    LinkLost {
        /// Remote peer
        peer: PeerId,
        /// Reason reported by the channel
        reason: String,
    },

    /// Reading the source file failed (E106)
    #[error("failed to read source for transfer {transfer}: {message}")]
    ChunkProducer {
        /// Affected transfer
        transfer: Uuid,
        /// Reason for failure
        message: String,
    },

    /// Reassembled artifact did not match its declared size (E107)
    #[error("transfer {transfer} ended with {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Affected transfer
        transfer: Uuid,
        /// Size declared in the metadata frame
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// Peer limit reached (E108)
    #[error("maximum of {0} connected peers reached")]
    PeerLimitReached(usize),

    /// Other transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid peer id format
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Request rejected before reaching the transport
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No open, handshaken peer to send to
    #[error("no connected peers to send to")]
    NoRecipients,

    /// Manager was destroyed; no further work is accepted
    #[error("connection manager destroyed")]
    Destroyed,

    /// Local endpoint has not been opened yet
    #[error("local endpoint not initialized")]
    NotInitialized,

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Invalid protocol message
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Unsupported protocol version
    #[error("unsupported protocol version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Blob store or recency cache failure
    #[error("store error: {0}")]
    StoreError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern EXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::IdentityConflict(_) => Some("E101"),
            Self::IdentityExhausted(_) => Some("E102"),
            Self::TransportTransient(_) => Some("E103"),
            Self::PeerUnreachable(_) => Some("E104"),
            Self::LinkLost { .. } => Some("E105"),
            Self::ChunkProducer { .. } => Some("E106"),
            Self::SizeMismatch { .. } => Some("E107"),
            Self::PeerLimitReached(_) => Some("E108"),
            _ => None,
        }
    }

    /// Returns whether this error is recoverable (can be retried).
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::IdentityConflict(_)
                | Self::TransportTransient(_)
                | Self::PeerUnreachable(_)
                | Self::LinkLost { .. }
                | Self::Timeout(_)
        )
    }

    /// Returns whether this error ends the session.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::IdentityExhausted(_))
    }
}

/// A surfaced error, as delivered on the session error bus.
///
/// Unlike [`Error`] this is `Clone`, so any number of subscribers can
/// receive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Error code, if the error has one
    pub code: Option<&'static str>,
    /// Human readable message
    pub message: String,
    /// Peer the error relates to
    pub peer: Option<PeerId>,
    /// Transfer the error relates to
    pub transfer: Option<Uuid>,
    /// Whether the session can continue
    pub fatal: bool,
}

impl ErrorReport {
    /// Attach a peer to the report.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Attach a transfer to the report.
    #[must_use]
    pub fn with_transfer(mut self, transfer: Uuid) -> Self {
        self.transfer = Some(transfer);
        self
    }
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        let peer = match err {
            Error::PeerUnreachable(peer) | Error::LinkLost { peer, .. } => Some(peer.clone()),
            _ => None,
        };
        let transfer = match err {
            Error::ChunkProducer { transfer, .. } | Error::SizeMismatch { transfer, .. } => {
                Some(*transfer)
            }
            _ => None,
        };

        Self {
            code: err.code(),
            message: err.to_string(),
            peer,
            transfer,
            fatal: err.is_fatal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let peer = PeerId::parse("ABC123").unwrap();
        assert_eq!(Error::PeerUnreachable(peer).code(), Some("E104"));
        assert_eq!(Error::IdentityConflict("X".into()).code(), Some("E101"));
        assert_eq!(Error::NoRecipients.code(), None);
    }

    #[test]
    fn test_recoverable_and_fatal() {
        assert!(Error::TransportTransient("socket".into()).is_recoverable());
        assert!(!Error::Destroyed.is_recoverable());
        assert!(Error::Destroyed.is_fatal());
        assert!(Error::IdentityExhausted(3).is_fatal());
        assert!(!Error::NoRecipients.is_fatal());
    }

    #[test]
    fn test_report_carries_context() {
        let transfer = Uuid::new_v4();
        let err = Error::ChunkProducer {
            transfer,
            message: "permission denied".into(),
        };

        let report = ErrorReport::from(&err);
        assert_eq!(report.code, Some("E106"));
        assert_eq!(report.transfer, Some(transfer));
        assert!(report.peer.is_none());
        assert!(report.message.contains("permission denied"));

        let peer = PeerId::parse("ZZ9ZZ9").unwrap();
        let report = ErrorReport::from(&Error::PeerUnreachable(peer.clone()));
        assert_eq!(report.peer, Some(peer));
    }
}
