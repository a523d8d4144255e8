//! Store command implementation.

use anyhow::{Context, Result};
use uuid::Uuid;

use nowhile_core::queue::format_size;
use nowhile_core::store::{BlobStore, FileBlobStore, StoredFile};

use super::{StoreAction, StoreArgs};

/// Run the store command.
pub async fn run(args: StoreArgs) -> Result<()> {
    let config = super::load_config();
    let store = FileBlobStore::open(super::store_dir(&config), config.storage.retention)
        .context("Failed to open file store")?;

    match args.action {
        StoreAction::List { json } => {
            let files = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&files)?);
            } else {
                display_files(&files);
            }
        }
        StoreAction::Prune => {
            let removed = store.prune_expired()?;
            println!("Removed {} expired file(s)", removed.len());
        }
        StoreAction::Delete { id } => {
            let id = parse_id(&id)?;
            if store.delete(&id)? {
                println!("Deleted {id}");
            } else {
                println!("No stored file with id {id}");
            }
        }
        StoreAction::Export { id, output } => {
            let id = parse_id(&id)?;
            let path = store.export(&id, &output)?;
            println!("Exported to {}", path.display());
        }
    }
    Ok(())
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id.trim()).with_context(|| format!("Invalid transfer id: {id}"))
}

fn display_files(files: &[StoredFile]) {
    println!();
    println!("Received Files:");
    println!("{}", "─".repeat(72));

    if files.is_empty() {
        println!("  (none)");
        println!("{}", "─".repeat(72));
        return;
    }

    for file in files {
        println!(
            "  {}  {:24}  {:>10}  from {}",
            file.transfer_id,
            file.name,
            format_size(file.size),
            file.sender_name
        );
        println!(
            "  {:36}  expires {}",
            "",
            file.expires_at.format("%Y-%m-%d %H:%M UTC")
        );
    }
    println!("{}", "─".repeat(72));
}
