//! CLI command definitions and handlers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use nowhile_core::config::Config;
use nowhile_core::error::ErrorReport;
use nowhile_core::identity::{LocalIdentity, PeerId};
use nowhile_core::recent::RecencyCache;
use nowhile_core::session::{Session, SessionEvent, SessionHandle};
use nowhile_core::store::FileBlobStore;
use nowhile_core::transport::tcp::TcpTransport;

/// Load configuration with graceful fallback to defaults.
///
/// A missing file yields defaults; an unreadable one is reported and
/// replaced by defaults so inspection commands still work.
pub fn load_config() -> Config {
    Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Ignoring unreadable configuration");
        Config::default()
    })
}

/// Identity file under the configured data directory.
pub fn identity_path(config: &Config) -> PathBuf {
    config.data_dir().join("identity.json")
}

/// Recent peers file under the configured data directory.
pub fn recent_path(config: &Config) -> PathBuf {
    config.data_dir().join("recent_peers.json")
}

/// Received file store under the configured data directory.
pub fn store_dir(config: &Config) -> PathBuf {
    config.data_dir().join("received")
}

/// Parse a `PEERID@host:port` address, resolving the host.
pub async fn parse_peer_addr(input: &str) -> Result<(PeerId, SocketAddr)> {
    let Some((id, host)) = input.split_once('@') else {
        bail!("Expected PEERID@host:port, got {input}");
    };
    let id = PeerId::parse(id)?;
    let addr = tokio::net::lookup_host(host)
        .await
        .with_context(|| format!("Failed to resolve {host}"))?
        .next()
        .with_context(|| format!("No address for {host}"))?;
    Ok((id, addr))
}

/// A session over TCP that presents the persisted identity, remembers
/// peers in the recent list and keeps received files in the file store.
pub struct NetSession {
    /// Handle to the running session
    pub handle: SessionHandle,
    /// Session events, subscribed before startup
    pub events: broadcast::Receiver<SessionEvent>,
    /// Surfaced errors
    pub errors: broadcast::Receiver<ErrorReport>,
    /// Address the listener is bound to
    pub local_addr: SocketAddr,
    finished: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
}

impl NetSession {
    /// Start a session listening on `port` that knows how to dial `peers`.
    pub async fn start(config: &Config, port: u16, peers: &[(PeerId, SocketAddr)]) -> Result<Self> {
        let identity_path = identity_path(config);
        let identity = LocalIdentity::load_or_create(&identity_path, &config.general.display_name)
            .context("Failed to load identity")?;
        let recent = RecencyCache::load_from(recent_path(config), config.recent.window)
            .context("Failed to load recent peers")?;
        let dir = store_dir(config);
        let store = FileBlobStore::open(&dir, config.storage.retention)
            .with_context(|| format!("Failed to open file store at {}", dir.display()))?;

        let transport = TcpTransport::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .with_context(|| format!("Failed to listen on port {port}"))?;
        for (id, addr) in peers {
            transport.add_peer(id.clone(), *addr);
        }
        let local_addr = transport.local_addr();
        let finished = Box::pin(transport.finished());

        let session = Session::new(transport, config.clone(), identity, Arc::new(store))
            .with_identity_path(identity_path)
            .with_recent(recent);
        let events = session.subscribe();
        let errors = session.subscribe_errors();
        let handle = session.start().await.context("Failed to start session")?;

        Ok(Self {
            handle,
            events,
            errors,
            local_addr,
            finished,
        })
    }

    /// Shut the session down and wait for queued frames to leave.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await?;
        let linger = nowhile_core::transport::tcp::CLOSE_LINGER;
        if tokio::time::timeout(linger * 2, self.finished).await.is_err() {
            tracing::warn!("Links did not finish flushing");
        }
        Ok(())
    }
}

pub mod config;
pub mod identity;
pub mod listen;
pub mod loopback;
pub mod recent;
pub mod send;
pub mod store;

/// Nowhile - direct peer-to-peer file transfer
#[derive(Parser)]
#[command(name = "nowhile")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Manage configuration
    Config(ConfigArgs),

    /// Show or replace the local peer id
    Identity(IdentityArgs),

    /// Manage recently connected peers
    Recent(RecentArgs),

    /// Manage received files
    Store(StoreArgs),

    /// Wait for peers to connect and receive their files
    Listen(ListenArgs),

    /// Send files to a peer over TCP
    Send(SendArgs),

    /// Send a file between two in-process peers
    Loopback(LoopbackArgs),
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Arguments for the identity command
#[derive(Parser)]
pub struct IdentityArgs {
    /// Identity subcommand
    #[command(subcommand)]
    pub action: IdentityAction,
}

/// Identity subcommands
#[derive(Subcommand)]
pub enum IdentityAction {
    /// Show the local peer id and display name
    Show {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Replace the local peer id with a new random one
    Regenerate,
}

/// Arguments for the recent command
#[derive(Parser)]
pub struct RecentArgs {
    /// Recent subcommand
    #[command(subcommand)]
    pub action: RecentAction,
}

/// Recent subcommands
#[derive(Subcommand)]
pub enum RecentAction {
    /// List peers seen within the recency window
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Forget one peer
    Remove {
        /// Peer id to forget
        id: String,
    },

    /// Forget every peer
    Clear,
}

/// Arguments for the store command
#[derive(Parser)]
pub struct StoreArgs {
    /// Store subcommand
    #[command(subcommand)]
    pub action: StoreAction,
}

/// Store subcommands
#[derive(Subcommand)]
pub enum StoreAction {
    /// List received files
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove files past their retention period
    Prune,

    /// Delete one received file
    Delete {
        /// Transfer id of the file
        id: String,
    },

    /// Copy a received file out of the store
    Export {
        /// Transfer id of the file
        id: String,

        /// Destination directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

/// Arguments for the loopback command
#[derive(Parser)]
pub struct LoopbackArgs {
    /// File to send
    pub file: PathBuf,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Keep the received copy in memory instead of the file store
    #[arg(long)]
    pub memory: bool,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the listen command
#[derive(Parser)]
pub struct ListenArgs {
    /// Port to listen on
    #[arg(short, long, default_value_t = nowhile_core::transport::tcp::DEFAULT_PORT)]
    pub port: u16,

    /// Exit after the first received file
    #[arg(long)]
    pub once: bool,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the send command
#[derive(Parser)]
pub struct SendArgs {
    /// Files to send
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Recipient as PEERID@host:port
    #[arg(short, long)]
    pub to: String,

    /// Local port to listen on (0 picks a free one)
    #[arg(short, long, default_value_t = 0)]
    pub port: u16,

    /// Chat line to send before the files
    #[arg(short, long)]
    pub message: Option<String>,

    /// Minimal output
    #[arg(short, long)]
    pub quiet: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
