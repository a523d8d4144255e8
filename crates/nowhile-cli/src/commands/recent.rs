//! Recent command implementation.

use anyhow::{Context, Result};
use chrono::Utc;

use nowhile_core::identity::PeerId;
use nowhile_core::recent::{RecencyCache, RecentPeer};

use super::{RecentAction, RecentArgs};

/// Run the recent command.
pub async fn run(args: RecentArgs) -> Result<()> {
    let config = super::load_config();
    let path = super::recent_path(&config);
    let mut cache =
        RecencyCache::load_from(path, config.recent.window).context("Failed to load recent peers")?;

    match args.action {
        RecentAction::List { json } => {
            let peers = cache.list();
            if json {
                println!("{}", serde_json::to_string_pretty(&peers)?);
            } else {
                display_peers(&peers);
            }
        }
        RecentAction::Remove { id } => {
            let id = PeerId::parse(&id)?;
            if cache.remove(&id)? {
                println!("Forgot {id}");
            } else {
                println!("{id} is not in the recent list");
            }
        }
        RecentAction::Clear => {
            let count = cache.len();
            cache.clear()?;
            println!("Forgot {count} peer(s)");
        }
    }
    Ok(())
}

fn display_peers(peers: &[RecentPeer]) {
    println!();
    println!("Recent Peers:");
    println!("{}", "─".repeat(48));

    if peers.is_empty() {
        println!("  (none)");
        println!("{}", "─".repeat(48));
        return;
    }

    let now = Utc::now();
    for peer in peers {
        println!(
            "  {:8}  {:20}  {}",
            peer.id.as_str(),
            truncate(&peer.name, 20),
            format_ago(now - peer.last_seen)
        );
    }
    println!("{}", "─".repeat(48));
}

fn format_ago(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
