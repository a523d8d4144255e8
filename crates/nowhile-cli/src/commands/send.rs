//! Send command implementation.
//!
//! Dials one peer over TCP under the persisted identity, queues the given
//! files, and waits until every one has been handed to the link.

use std::collections::HashSet;
use std::io::{self, Write};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;

use nowhile_core::queue::format_size;
use nowhile_core::session::SessionEvent;
use nowhile_core::transfer::TransferEvent;

use super::{NetSession, SendArgs};

/// Run the send command.
pub async fn run(args: SendArgs) -> Result<()> {
    let config = super::load_config();
    config.validate()?;

    for file in &args.files {
        if !file.is_file() {
            bail!("Not a file: {}", file.display());
        }
    }

    let (peer, addr) = super::parse_peer_addr(&args.to).await?;
    let mut session = NetSession::start(&config, args.port, &[(peer.clone(), addr)]).await?;
    let handle = session.handle.clone();

    handle.connect(peer.as_str()).await?;
    let connect_deadline = tokio::time::sleep(config.connection.open_timeout);
    tokio::pin!(connect_deadline);
    let name = loop {
        tokio::select! {
            event = session.events.recv() => match event {
                Ok(SessionEvent::PeerUpdated(link)) if link.id == peer => break link.name,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Session stopped before connecting"),
            },
            report = session.errors.recv() => match report {
                Ok(report) => bail!("{}", report.message),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Session stopped before connecting"),
            },
            () = &mut connect_deadline => bail!("No answer from {peer} at {addr}"),
        }
    };
    if !args.quiet && !args.json {
        println!();
        println!("  Connected to {name} ({peer}) as {}", handle.local_id());
    }

    if let Some(text) = &args.message {
        handle.send_chat(text.clone()).await?;
    }

    let mut total = 0;
    for file in &args.files {
        let queued = handle
            .queue_file(file)
            .await
            .with_context(|| format!("Failed to queue {}", file.display()))?;
        total += queued.size;
    }

    let started_at = Instant::now();
    let started = handle.send_queue_to(vec![peer.clone()]).await?;
    let mut pending: HashSet<_> = started.iter().copied().collect();

    let result = loop {
        if pending.is_empty() {
            break Ok(());
        }
        tokio::select! {
            event = session.events.recv() => match event {
                Ok(SessionEvent::Transfer(TransferEvent::Progress { transfer_id, progress, .. }))
                    if pending.contains(&transfer_id) =>
                {
                    if !args.quiet && !args.json {
                        print!("\r  {:>3}%  {} file(s) left", progress, pending.len());
                        let _ = io::stdout().flush();
                    }
                }
                Ok(SessionEvent::Transfer(TransferEvent::Completed(record))) => {
                    if pending.remove(&record.id) && !args.quiet && !args.json {
                        println!("\r  Sent {} ({})       ", record.file_name, format_size(record.file_size));
                    }
                }
                Ok(SessionEvent::Transfer(TransferEvent::Failed { record, reason }))
                    if pending.contains(&record.id) =>
                {
                    break Err(format!("{} failed: {reason}", record.file_name));
                }
                Ok(SessionEvent::Transfer(TransferEvent::Abandoned(record)))
                    if pending.contains(&record.id) =>
                {
                    break Err(format!("{} abandoned: link to {peer} lost", record.file_name));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Err("Session stopped".to_string()),
            },
            _ = tokio::signal::ctrl_c() => break Err("Interrupted".to_string()),
        }
    };
    let elapsed = started_at.elapsed();

    session.shutdown().await?;
    if let Err(message) = result {
        bail!("{message}");
    }

    if args.json {
        let output = serde_json::json!({
            "to": peer,
            "transfers": started,
            "bytes": total,
            "seconds": elapsed.as_secs_f64(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet {
        println!(
            "  {} file(s), {} in {:.2}s",
            started.len(),
            format_size(total),
            elapsed.as_secs_f64()
        );
        println!();
    }
    Ok(())
}
