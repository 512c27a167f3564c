//! Show key status for a user.

use anyhow::Result;
use vault_service::{Vault, VaultError};
use vault_types::UserId;

/// Run the status command.
pub async fn run(vault: &Vault, user: &UserId) -> Result<()> {
    println!("=== chatvault status: {} ===", user);
    println!();

    let status = match vault.key_status(user).await {
        Ok(status) => status,
        Err(VaultError::KeyNotProvisioned { .. }) => {
            println!("Key: NOT PROVISIONED");
            println!();
            println!("A key is created on the user's first encrypted write.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!("Key:");
    println!("  Version: {}", status.version);
    match status.rotated_at {
        Some(ts) => println!("  Rotated: {}", ts),
        None => println!("  Rotated: never"),
    }

    println!();
    println!("Rows below current version:");
    for (provider, count) in &status.behind_current {
        println!("  {:<12} {}", provider, count);
    }

    println!();
    println!("Legacy plaintext messages: {}", status.legacy_messages);
    if status.legacy_messages > 0 {
        println!("Run 'chatvault encrypt-legacy --user {}' to seal them.", user);
    }

    Ok(())
}
