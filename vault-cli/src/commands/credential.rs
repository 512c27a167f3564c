//! Manage provider API keys.

use anyhow::{Context, Result};
use vault_service::Vault;
use vault_types::UserId;

/// Store an API key for a provider, exactly as given.
///
/// Keys with leading or trailing whitespace are rejected rather than
/// trimmed.
pub async fn set(vault: &Vault, user: &UserId, provider: &str, api_key: &str) -> Result<()> {
    if api_key.trim().is_empty() {
        anyhow::bail!("API key must not be empty");
    }
    if api_key.trim() != api_key {
        anyhow::bail!("API key has leading or trailing whitespace");
    }
    vault.credentials().set(user, provider, api_key).await?;
    println!("Stored {} key for {}", provider, user);
    Ok(())
}

/// Show a stored API key, masked unless `reveal` is set.
pub async fn get(vault: &Vault, user: &UserId, provider: &str, reveal: bool) -> Result<()> {
    match vault.credentials().get(user, provider).await? {
        Some(api_key) if reveal => println!("{}", api_key.as_str()),
        Some(api_key) => println!("{}", mask(&api_key)),
        None => println!("No {} key stored for {}", provider, user),
    }
    Ok(())
}

/// Delete a stored API key.
pub async fn delete(vault: &Vault, user: &UserId, provider: &str) -> Result<()> {
    if vault.credentials().delete(user, provider).await? {
        println!("Deleted {} key for {}", provider, user);
    } else {
        println!("No {} key stored for {}", provider, user);
    }
    Ok(())
}

/// List providers with a stored key.
pub async fn list(vault: &Vault, user: &UserId) -> Result<()> {
    let providers = vault.credentials().providers(user).await?;
    if providers.is_empty() {
        println!("No keys stored for {}", user);
    }
    for provider in providers {
        println!("{}", provider);
    }
    Ok(())
}

/// Prompt for an API key with echo suppression.
pub fn prompt_api_key(provider: &str) -> Result<String> {
    rpassword::prompt_password(format!("{} API key: ", provider))
        .context("Failed to read API key")
}

/// Keep the last four characters visible.
fn mask(api_key: &str) -> String {
    let chars: Vec<char> = api_key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[tokio::test]
    async fn set_get_delete() {
        let vault = testing::vault().await;

        set(&vault, &alice(), "openai", "sk-test-123").await.unwrap();
        let stored = vault
            .credentials()
            .get(&alice(), "openai")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.as_str(), "sk-test-123");

        assert!(get(&vault, &alice(), "openai", false).await.is_ok());
        assert!(list(&vault, &alice()).await.is_ok());

        delete(&vault, &alice(), "openai").await.unwrap();
        assert!(vault
            .credentials()
            .get(&alice(), "openai")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let vault = testing::vault().await;
        assert!(set(&vault, &alice(), "openai", "   ").await.is_err());
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_rejected_not_trimmed() {
        let vault = testing::vault().await;
        for key in [" sk-x", "sk-x ", "sk-x\n", "\tsk-x"] {
            assert!(set(&vault, &alice(), "openai", key).await.is_err(), "{:?}", key);
        }
        assert!(vault
            .credentials()
            .get(&alice(), "openai")
            .await
            .unwrap()
            .is_none());

        set(&vault, &alice(), "openai", "sk x").await.unwrap();
        let stored = vault
            .credentials()
            .get(&alice(), "openai")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.as_str(), "sk x");
    }

    #[test]
    fn mask_hides_all_but_tail() {
        assert_eq!(mask("sk-test-123"), "*******-123");
        assert_eq!(mask("short"), "*****");
    }
}
