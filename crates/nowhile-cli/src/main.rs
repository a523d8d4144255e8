//! Nowhile CLI - direct peer-to-peer file transfer
//!
//! Send and receive files over direct TCP links, inspect and manage the
//! local state Nowhile keeps between sessions, and exercise the transfer
//! pipeline end to end without a network.
//!
//! ## Quick Start
//!
//! ```bash
//! # Show the identity other peers see
//! nowhile identity show
//!
//! # Receive files on this machine
//! nowhile listen
//!
//! # Send a file to it from another one
//! nowhile send ./photo.jpg --to K7P2QX@192.168.1.20:52531
//!
//! # Push a file through two in-process peers
//! nowhile loopback ./photo.jpg
//!
//! # List what has been received
//! nowhile store list
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Config(args) => commands::config::run(args).await,
        Command::Identity(args) => commands::identity::run(args).await,
        Command::Recent(args) => commands::recent::run(args).await,
        Command::Store(args) => commands::store::run(args).await,
        Command::Listen(args) => commands::listen::run(args).await,
        Command::Send(args) => commands::send::run(args).await,
        Command::Loopback(args) => commands::loopback::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,nowhile=info,nowhile_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
