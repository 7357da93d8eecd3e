//! Account Store — identity, encrypted tokens, plan, status, reset_at.

mod sqlite;

pub use sqlite::SqliteAccountStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Plus,
    Pro,
    Team,
    Business,
    Enterprise,
    Edu,
    #[serde(other)]
    Unknown,
}

impl PlanType {
    pub fn from_str_lenient(raw: &str) -> Self {
        match raw {
            "free" => Self::Free,
            "plus" => Self::Plus,
            "pro" => Self::Pro,
            "team" => Self::Team,
            "business" => Self::Business,
            "enterprise" => Self::Enterprise,
            "edu" => Self::Edu,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Plus => "plus",
            Self::Pro => "pro",
            Self::Team => "team",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
            Self::Edu => "edu",
            Self::Unknown => "unknown",
        }
    }

    /// Tier used by the selection engine's tier-weighted scoring (spec §4.G).
    pub fn tier(&self) -> Tier {
        match self {
            Self::Pro => Tier::Pro,
            Self::Plus | Self::Team | Self::Business => Tier::Plus,
            Self::Free | Self::Enterprise | Self::Edu | Self::Unknown => Tier::Free,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Free,
    Plus,
    Pro,
}

impl Tier {
    pub fn weight(&self) -> f64 {
        match self {
            Tier::Pro => 1.00,
            Tier::Plus => 0.72,
            Tier::Free => 0.512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Paused,
    RateLimited,
    QuotaExceeded,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Deactivated => "deactivated",
        }
    }

    pub fn from_str_lenient(raw: &str) -> Self {
        match raw {
            "paused" => Self::Paused,
            "rate_limited" => Self::RateLimited,
            "quota_exceeded" => Self::QuotaExceeded,
            "deactivated" => Self::Deactivated,
            _ => Self::Active,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::RateLimited | Self::QuotaExceeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    AuthRefreshFailed,
    PermanentUpstreamFailure,
}

impl DeactivationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRefreshFailed => "auth_refresh_failed",
            Self::PermanentUpstreamFailure => "permanent_upstream_failure",
        }
    }

    pub fn from_str_lenient(raw: &str) -> Self {
        match raw {
            "auth_refresh_failed" => Self::AuthRefreshFailed,
            _ => Self::PermanentUpstreamFailure,
        }
    }
}

/// Durable account record. Encrypted token fields are opaque `String`s here
/// — only `crate::token::TokenManager` decrypts them, never the store.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub email: Option<String>,
    pub plan_type: PlanType,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub id_token_encrypted: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
    pub status: AccountStatus,
    pub deactivation_reason: Option<DeactivationReason>,
    pub reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: String,
    pub email: Option<String>,
    pub plan_type: PlanType,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub id_token_encrypted: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub id_token_encrypted: Option<String>,
    pub access_token_expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create(&self, account: NewAccount) -> anyhow::Result<Account>;
    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Account>>;
    async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<Account>>;
    async fn list(&self) -> anyhow::Result<Vec<Account>>;
    async fn update_tokens(&self, id: &str, update: TokenUpdate) -> anyhow::Result<()>;
    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        reset_at: Option<DateTime<Utc>>,
        deactivation_reason: Option<DeactivationReason>,
    ) -> anyhow::Result<()>;
    /// Bulk-transition a set of accounts to `active`, clearing `reset_at`.
    /// Used by the Reconciler (spec §4.K).
    async fn bulk_clear_to_active(&self, ids: &[String]) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;
}

#[cfg(test)]
mod memory_store_for_tests {
    //! A minimal in-memory `AccountStore` used by other modules' unit tests
    //! (selection, mark, reconciler) so they don't need a SQLite fixture.
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct InMemoryAccountStore {
        accounts: RwLock<HashMap<String, Account>>,
    }

    impl InMemoryAccountStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed(&self, account: Account) {
            self.accounts.write().await.insert(account.id.clone(), account);
        }
    }

    #[async_trait]
    impl AccountStore for InMemoryAccountStore {
        async fn create(&self, new: NewAccount) -> anyhow::Result<Account> {
            let now = Utc::now();
            let account = Account {
                id: new.id,
                email: new.email,
                plan_type: new.plan_type,
                access_token_encrypted: new.access_token_encrypted,
                refresh_token_encrypted: new.refresh_token_encrypted,
                id_token_encrypted: new.id_token_encrypted,
                access_token_expires_at: new.access_token_expires_at,
                status: AccountStatus::Active,
                deactivation_reason: None,
                reset_at: None,
                created_at: now,
                updated_at: now,
            };
            self.accounts.write().await.insert(account.id.clone(), account.clone());
            Ok(account)
        }

        async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Account>> {
            Ok(self.accounts.read().await.get(id).cloned())
        }

        async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<Account>> {
            Ok(self
                .accounts
                .read()
                .await
                .values()
                .find(|a| a.email.as_deref() == Some(email))
                .cloned())
        }

        async fn list(&self) -> anyhow::Result<Vec<Account>> {
            Ok(self.accounts.read().await.values().cloned().collect())
        }

        async fn update_tokens(&self, id: &str, update: TokenUpdate) -> anyhow::Result<()> {
            if let Some(a) = self.accounts.write().await.get_mut(id) {
                a.access_token_encrypted = update.access_token_encrypted;
                a.refresh_token_encrypted = update.refresh_token_encrypted;
                a.id_token_encrypted = update.id_token_encrypted;
                a.access_token_expires_at = update.access_token_expires_at;
                a.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn update_status(
            &self,
            id: &str,
            status: AccountStatus,
            reset_at: Option<DateTime<Utc>>,
            deactivation_reason: Option<DeactivationReason>,
        ) -> anyhow::Result<()> {
            if let Some(a) = self.accounts.write().await.get_mut(id) {
                a.status = status;
                a.reset_at = reset_at;
                a.deactivation_reason = deactivation_reason;
                a.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn bulk_clear_to_active(&self, ids: &[String]) -> anyhow::Result<()> {
            let mut accounts = self.accounts.write().await;
            for id in ids {
                if let Some(a) = accounts.get_mut(id) {
                    a.status = AccountStatus::Active;
                    a.reset_at = None;
                    a.updated_at = Utc::now();
                }
            }
            Ok(())
        }

        async fn delete(&self, id: &str) -> anyhow::Result<bool> {
            Ok(self.accounts.write().await.remove(id).is_some())
        }
    }
}

#[cfg(test)]
pub use memory_store_for_tests::InMemoryAccountStore;
