//! # Nowhile Core Library
//!
//! `nowhile-core` provides the core of Nowhile: direct peer-to-peer file
//! transfer over a pluggable transport, without a relay that stores data.
//!
//! ## Features
//!
//! - **Supervised links**: one link per peer, automatic endpoint reconnection
//! - **Chunked transfers**: files streamed as ordered 64 KiB frames
//! - **Isolated producers**: file reads run on a reusable worker pool
//! - **Live progress**: throttled, monotonic progress per transfer
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - Peer link registry and endpoint supervision
//! - [`identity`] - Peer ids and the persisted local identity
//! - [`producer`] - Chunk producer worker pool
//! - [`protocol`] - Wire frames and their byte encoding
//! - [`queue`] - Files waiting to be sent
//! - [`recent`] - Recently connected peers
//! - [`session`] - The orchestrator tying everything together
//! - [`store`] - Persistent storage for received files
//! - [`transfer`] - Outbound streams, inbound reassembly, progress
//! - [`transport`] - Transport link contract and an in-memory network
//!
//! ## Example
//!
//! ```rust,ignore
//! use nowhile_core::session::Session;
//!
//! let session = Session::new(transport, config, identity, store);
//! let mut events = session.subscribe();
//! let handle = session.start().await?;
//! handle.connect("K7Q2ZD").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod producer;
pub mod protocol;
pub mod queue;
pub mod recent;
pub mod session;
pub mod store;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};
pub use identity::PeerId;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for frames on the wire
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default number of chunk producer workers
pub const DEFAULT_PRODUCER_WORKERS: usize = 4;

/// Default maximum number of simultaneous peer links
pub const DEFAULT_MAX_PEERS: usize = 5;

/// Default interval between endpoint reconnection attempts in seconds
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Default minimum spacing between progress updates in milliseconds
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

/// Default retention for recent peers and stored files in hours
pub const DEFAULT_RETENTION_HOURS: u64 = 24;
