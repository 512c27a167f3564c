//! Encrypt legacy plaintext messages.

use anyhow::Result;
use vault_service::Vault;
use vault_types::UserId;

/// Run the encrypt-legacy command.
pub async fn run(vault: &Vault, user: &UserId) -> Result<()> {
    let migrated = vault.encrypt_legacy(user).await?;
    if migrated == 0 {
        println!("No legacy messages for {}", user);
    } else {
        println!("Encrypted {} legacy messages for {}", migrated, user);
    }
    Ok(())
}
