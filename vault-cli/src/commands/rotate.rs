//! Rotate a user's key.

use anyhow::{Context, Result};
use vault_service::Vault;
use vault_types::UserId;

/// Run the rotate command.
pub async fn run(vault: &Vault, user: &UserId) -> Result<()> {
    let report = vault
        .rotate(user)
        .await
        .with_context(|| format!("Rotation for {} did not complete; rerun to resume", user))?;

    println!("Rotated {} from {} to {}", user, report.from, report.to);
    for (provider, count) in &report.migrated {
        println!("  {:<12} {} rows", provider, count);
    }
    println!("  {} batches", report.batches);

    Ok(())
}
