//! Listen command implementation.
//!
//! Runs a session on a TCP port under the persisted identity and reports
//! what connecting peers do until interrupted.

use anyhow::{bail, Result};
use tokio::sync::broadcast::error::RecvError;

use nowhile_core::queue::format_size;
use nowhile_core::session::SessionEvent;
use nowhile_core::transfer::{TransferDirection, TransferEvent};

use super::{ListenArgs, NetSession};

/// Run the listen command.
pub async fn run(args: ListenArgs) -> Result<()> {
    let config = super::load_config();
    config.validate()?;

    let mut session = NetSession::start(&config, args.port, &[]).await?;
    let local_id = session.handle.local_id();

    if args.json {
        print_json(&serde_json::json!({
            "event": "listening",
            "id": local_id,
            "addr": session.local_addr.to_string(),
        }))?;
    } else {
        println!();
        println!("  Listening as {} on {}", local_id, session.local_addr);
        println!("  Senders connect with --to {}@<this-host>:{}", local_id, session.local_addr.port());
        println!();
    }

    let outcome = loop {
        tokio::select! {
            event = session.events.recv() => match event {
                Ok(SessionEvent::FileReceived(stored)) => {
                    if args.json {
                        print_json(&serde_json::json!({
                            "event": "file_received",
                            "transfer_id": stored.transfer_id,
                            "name": stored.name,
                            "size": stored.size,
                            "from": stored.sender_id,
                        }))?;
                    } else {
                        println!(
                            "  Received {} ({}) from {} as {}",
                            stored.name,
                            format_size(stored.size),
                            stored.sender_name,
                            stored.transfer_id
                        );
                    }
                    if args.once {
                        break Ok(());
                    }
                }
                Ok(event) => {
                    if args.json {
                        print_event_json(&event)?;
                    } else {
                        print_event(&event);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },
            report = session.errors.recv() => match report {
                Ok(report) if report.fatal => break Err(report.message),
                Ok(report) => {
                    if !args.json {
                        println!("  ! {}", report.message);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break Ok(()),
            },
            _ = tokio::signal::ctrl_c() => break Ok(()),
        }
    };

    session.shutdown().await?;
    if let Err(message) = outcome {
        bail!("{message}");
    }
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerUpdated(link) => {
            println!("  Connected to {} ({})", link.name, link.id);
        }
        SessionEvent::ConnectionChanged {
            peer,
            connected: false,
        } => println!("  {peer} disconnected"),
        SessionEvent::ChatReceived { message, .. } => {
            println!("  <{}> {}", message.sender_name, message.text);
        }
        SessionEvent::Transfer(TransferEvent::Started(record))
            if record.direction == TransferDirection::Incoming =>
        {
            println!(
                "  Receiving {} ({})",
                record.file_name,
                format_size(record.file_size)
            );
        }
        SessionEvent::Transfer(TransferEvent::Failed { record, reason }) => {
            println!("  Transfer of {} failed: {reason}", record.file_name);
        }
        SessionEvent::Transfer(TransferEvent::Abandoned(record)) => {
            println!("  Transfer of {} abandoned", record.file_name);
        }
        SessionEvent::IdentityRegenerated { new, .. } => println!("  Now listening as {new}"),
        _ => {}
    }
}

fn print_event_json(event: &SessionEvent) -> Result<()> {
    let value = match event {
        SessionEvent::PeerUpdated(link) => serde_json::json!({
            "event": "connected",
            "id": link.id,
            "name": link.name,
        }),
        SessionEvent::ConnectionChanged {
            peer,
            connected: false,
        } => serde_json::json!({ "event": "disconnected", "id": peer }),
        SessionEvent::ChatReceived { from, message } => serde_json::json!({
            "event": "chat",
            "from": from,
            "text": message.text,
        }),
        _ => return Ok(()),
    };
    print_json(&value)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
