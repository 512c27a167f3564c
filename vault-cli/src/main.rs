//! # chatvault
//!
//! Operator CLI for the chatvault confidentiality layer.
//!
//! ## Commands
//!
//! - `status`: Show a user's key version and migration backlog
//! - `rotate`: Re-encrypt a user's content under a new key version
//! - `encrypt-legacy`: Seal a user's plaintext messages from before encryption
//! - `credential`: Set, show, delete or list provider API keys
//!
//! ## Example
//!
//! ```bash
//! export CHATVAULT_MASTER_SECRET=...
//! export CHATVAULT_CREDENTIAL_SALT=...
//!
//! chatvault status --user alice
//! chatvault rotate --user alice
//! chatvault credential set --user alice --provider openai
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vault_service::{Config, Vault};
use vault_types::UserId;

mod commands;

use commands::{credential, legacy, rotate, status};

/// Operator CLI for chatvault.
#[derive(Parser, Debug)]
#[command(name = "chatvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (secrets may come from the environment instead)
    #[arg(long, short, global = true, default_value = "chatvault.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show key version and rows awaiting migration
    Status {
        /// User to inspect
        #[arg(long, short)]
        user: UserId,
    },

    /// Rotate a user's key, re-encrypting all of their content
    Rotate {
        /// User to rotate
        #[arg(long, short)]
        user: UserId,
    },

    /// Encrypt a user's legacy plaintext messages
    EncryptLegacy {
        /// User to migrate
        #[arg(long, short)]
        user: UserId,
    },

    /// Manage provider API keys
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand, Debug)]
enum CredentialAction {
    /// Store an API key (prompts if --api-key is not given)
    Set {
        /// Owning user
        #[arg(long, short)]
        user: UserId,

        /// Provider name, e.g. openai
        #[arg(long, short)]
        provider: String,

        /// API key value
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Show a stored API key
    Get {
        /// Owning user
        #[arg(long, short)]
        user: UserId,

        /// Provider name
        #[arg(long, short)]
        provider: String,

        /// Print the full key instead of a masked form
        #[arg(long)]
        reveal: bool,
    },

    /// Delete a stored API key
    Delete {
        /// Owning user
        #[arg(long, short)]
        user: UserId,

        /// Provider name
        #[arg(long, short)]
        provider: String,
    },

    /// List providers with a stored key
    List {
        /// Owning user
        #[arg(long, short)]
        user: UserId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = load_config(&cli.config)?;
    let vault = Vault::open(&config)
        .await
        .context("Failed to open vault")?;

    match cli.command {
        Commands::Status { user } => status::run(&vault, &user).await?,
        Commands::Rotate { user } => rotate::run(&vault, &user).await?,
        Commands::EncryptLegacy { user } => legacy::run(&vault, &user).await?,
        Commands::Credential { action } => match action {
            CredentialAction::Set {
                user,
                provider,
                api_key,
            } => {
                let api_key = match api_key {
                    Some(key) => key,
                    None => credential::prompt_api_key(&provider)?,
                };
                credential::set(&vault, &user, &provider, &api_key).await?;
            }
            CredentialAction::Get {
                user,
                provider,
                reveal,
            } => credential::get(&vault, &user, &provider, reveal).await?,
            CredentialAction::Delete { user, provider } => {
                credential::delete(&vault, &user, &provider).await?
            }
            CredentialAction::List { user } => credential::list(&vault, &user).await?,
        },
    }

    Ok(())
}

/// Read the config file if present, then apply environment overrides.
fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        tracing::debug!("No config file at {}, using defaults", path.display());
        Config::default()
    };
    config.apply_env();
    Ok(config)
}
