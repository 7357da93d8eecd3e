//! `codex-lb` entry points — `serve` (default) and `migrate-legacy-accounts`
//! (spec §6). Grounded on the teacher's `main.rs` startup shape: init
//! tracing, load `Config`, dispatch, map startup failure to a non-zero exit
//! code rather than panicking.

use crate::account::{AccountStore, NewAccount, PlanType, SqliteAccountStore};
use crate::config::Config;
use crate::crypto::TokenCipher;
use clap::{Parser, Subcommand};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "codex-lb", about = "Reverse-proxy load balancer for Codex/ChatGPT backend accounts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the proxy server until a shutdown signal is received. Default
    /// when no subcommand is given.
    Serve,
    /// Imports accounts from a legacy JSON export into the accounts
    /// database, encrypting tokens on the way in.
    MigrateLegacyAccounts {
        #[arg(long)]
        from: PathBuf,
    },
}

/// Startup failure kinds that map to the exit codes documented in §6:
/// `1` for configuration problems, `2` for storage problems.
pub enum StartupError {
    Config(anyhow::Error),
    Storage(anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Storage(_) => 2,
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "configuration error: {e}"),
            StartupError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), StartupError> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = Config::from_env().map_err(|e| StartupError::Config(e.into()))?;
            crate::app::serve(config).await.map_err(StartupError::Storage)
        }
        Command::MigrateLegacyAccounts { from } => migrate_legacy_accounts(&from).await,
    }
}

#[derive(Debug, Deserialize)]
struct LegacyAccount {
    id: String,
    email: Option<String>,
    #[serde(default)]
    plan_type: String,
    access_token: String,
    refresh_token: String,
    id_token: Option<String>,
    access_token_expires_at: DateTime<Utc>,
}

fn parse_plan_type(raw: &str) -> PlanType {
    match raw.to_ascii_lowercase().as_str() {
        "plus" => PlanType::Plus,
        "pro" => PlanType::Pro,
        "team" => PlanType::Team,
        "business" => PlanType::Business,
        "enterprise" => PlanType::Enterprise,
        "edu" => PlanType::Edu,
        _ => PlanType::Free,
    }
}

async fn migrate_legacy_accounts(from: &PathBuf) -> Result<(), StartupError> {
    let config = Config::from_env().map_err(|e| StartupError::Config(e.into()))?;
    let raw = tokio::fs::read_to_string(from)
        .await
        .map_err(|e| StartupError::Config(anyhow::anyhow!("reading {}: {e}", from.display())))?;
    let legacy: Vec<LegacyAccount> =
        serde_json::from_str(&raw).map_err(|e| StartupError::Config(anyhow::anyhow!("parsing {}: {e}", from.display())))?;

    let cipher = Arc::new(
        TokenCipher::load_or_create(&config.encryption_key_file)
            .await
            .map_err(StartupError::Storage)?,
    );
    let accounts: Arc<dyn AccountStore> =
        Arc::new(SqliteAccountStore::open(&config.accounts_database_url).map_err(StartupError::Storage)?);

    let mut imported = 0usize;
    for account in legacy {
        let access_token_encrypted = cipher.encrypt(&account.access_token).map_err(StartupError::Storage)?;
        let refresh_token_encrypted = cipher.encrypt(&account.refresh_token).map_err(StartupError::Storage)?;
        let id_token_encrypted = account
            .id_token
            .as_deref()
            .map(|t| cipher.encrypt(t))
            .transpose()
            .map_err(StartupError::Storage)?;

        accounts
            .create(NewAccount {
                id: account.id,
                email: account.email,
                plan_type: parse_plan_type(&account.plan_type),
                access_token_encrypted,
                refresh_token_encrypted,
                id_token_encrypted,
                access_token_expires_at: account.access_token_expires_at,
            })
            .await
            .map_err(StartupError::Storage)?;
        imported += 1;
    }

    tracing::info!(imported, path = %from.display(), "migrated legacy accounts");
    Ok(())
}
