//! Loopback command implementation.
//!
//! Starts two sessions on an in-process network, connects them, and sends
//! one file from the first to the second. Everything except the wire is
//! the real pipeline: handshake, chunk producers, reassembly, progress and
//! the blob store.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;

use nowhile_core::identity::LocalIdentity;
use nowhile_core::queue::format_size;
use nowhile_core::session::{Session, SessionEvent};
use nowhile_core::store::{BlobStore, FileBlobStore, MemoryBlobStore, StoredFile};
use nowhile_core::transfer::TransferEvent;
use nowhile_core::transport::memory::MemoryNetwork;

use super::LoopbackArgs;

/// Run the loopback command.
pub async fn run(args: LoopbackArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(chunk_size) = args.chunk_size {
        config.transfer.chunk_size = chunk_size;
    }
    config.validate()?;

    if !args.file.is_file() {
        bail!("Not a file: {}", args.file.display());
    }

    let store: Arc<dyn BlobStore> = if args.memory {
        Arc::new(MemoryBlobStore::new(config.storage.retention))
    } else {
        let dir = super::store_dir(&config);
        Arc::new(
            FileBlobStore::open(&dir, config.storage.retention)
                .with_context(|| format!("Failed to open file store at {}", dir.display()))?,
        )
    };

    let network = MemoryNetwork::new();
    let name = config.general.display_name.clone();

    let sender = Session::new(
        network.transport(),
        config.clone(),
        LocalIdentity::generate(format!("{name} (sender)")),
        Arc::new(MemoryBlobStore::new(config.storage.retention)),
    );
    let mut sender_events = sender.subscribe();
    let sender = sender.start().await.context("Failed to start sending peer")?;

    let receiver = Session::new(
        network.transport(),
        config.clone(),
        LocalIdentity::generate(format!("{name} (receiver)")),
        store,
    );
    let mut events = receiver.subscribe();
    let mut errors = receiver.subscribe_errors();
    let receiver = receiver
        .start()
        .await
        .context("Failed to start receiving peer")?;

    let receiver_id = receiver.local_id();
    sender.connect(receiver_id.as_str()).await?;
    loop {
        match sender_events.recv().await {
            Ok(SessionEvent::PeerUpdated(link)) if link.id == receiver_id => break,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("Sending peer stopped before connecting"),
        }
    }

    let queued = sender.queue_file(&args.file).await?;
    if !args.quiet && !args.json {
        println!();
        println!(
            "  Sending {} ({}) {} -> {}",
            queued.name,
            format_size(queued.size),
            sender.local_id(),
            receiver_id
        );
    }

    let started_at = Instant::now();
    sender.send_queue().await?;

    let stored = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Transfer(TransferEvent::Progress { progress, bytes_transferred, .. })) => {
                    if !args.quiet && !args.json {
                        print!("\r  {:>3}%  {:>10}", progress, format_size(bytes_transferred));
                        let _ = io::stdout().flush();
                    }
                }
                Ok(SessionEvent::Transfer(TransferEvent::Failed { reason, .. })) => {
                    bail!("Transfer failed: {reason}");
                }
                Ok(SessionEvent::FileReceived(stored)) => break stored,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Receiving peer stopped"),
            },
            report = errors.recv() => match report {
                Ok(report) => bail!("{}", report.message),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Receiving peer stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                bail!("Interrupted");
            }
        }
    };
    let elapsed = started_at.elapsed();

    sender.shutdown().await?;
    receiver.shutdown().await?;

    if stored.size != queued.size {
        bail!(
            "Received {} bytes but the source has {}",
            stored.size,
            queued.size
        );
    }

    if args.json {
        output_json(&stored, elapsed.as_secs_f64(), args.memory)?;
    } else if !args.quiet {
        println!();
        println!(
            "  Received {} in {:.2}s ({}/s)",
            stored.name,
            elapsed.as_secs_f64(),
            format_size(throughput(stored.size, elapsed.as_secs_f64()))
        );
        if args.memory {
            println!("  Kept in memory only");
        } else {
            println!("  Stored as {}", stored.transfer_id);
        }
        println!();
    }
    Ok(())
}

fn output_json(stored: &StoredFile, seconds: f64, memory: bool) -> Result<()> {
    let output = serde_json::json!({
        "transfer_id": stored.transfer_id,
        "name": stored.name,
        "size": stored.size,
        "mime_type": stored.mime_type,
        "seconds": seconds,
        "persisted": !memory,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn throughput(bytes: u64, seconds: f64) -> u64 {
    if seconds <= f64::EPSILON {
        return bytes;
    }
    (bytes as f64 / seconds) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(1000, 2.0), 500);
        assert_eq!(throughput(1000, 0.0), 1000);
    }
}
