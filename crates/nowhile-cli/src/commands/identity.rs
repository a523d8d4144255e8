//! Identity command implementation.

use anyhow::{Context, Result};

use nowhile_core::identity::LocalIdentity;

use super::{IdentityAction, IdentityArgs};

/// Run the identity command.
pub async fn run(args: IdentityArgs) -> Result<()> {
    let config = super::load_config();
    let path = super::identity_path(&config);
    let mut identity = LocalIdentity::load_or_create(&path, &config.general.display_name)
        .context("Failed to load identity")?;

    match args.action {
        IdentityAction::Show { json } => {
            if json {
                let output = serde_json::json!({
                    "id": identity.id,
                    "name": identity.name,
                    "created_at": identity.created_at,
                    "path": path,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!();
                println!("  Peer id:  {}", identity.id);
                println!("  Name:     {}", identity.name);
                println!(
                    "  Created:  {}",
                    identity.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                println!();
            }
        }
        IdentityAction::Regenerate => {
            let old = identity.regenerate();
            identity
                .save_to(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Peer id changed: {} -> {}", old, identity.id);
        }
    }
    Ok(())
}
