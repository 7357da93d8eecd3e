//! Reconciler — lazily converges stale blocked accounts back to `active`
//! on read paths, without requiring live traffic to touch them (spec §4.K).

use crate::account::{AccountStatus, AccountStore};
use crate::snapshot::SnapshotBuilder;
use chrono::Utc;
use std::sync::Arc;

pub struct Reconciler {
    accounts: Arc<dyn AccountStore>,
    snapshot: Arc<SnapshotBuilder>,
}

impl Reconciler {
    pub fn new(accounts: Arc<dyn AccountStore>, snapshot: Arc<SnapshotBuilder>) -> Self {
        Self { accounts, snapshot }
    }

    /// Clears every blocked account whose `reset_at` has already passed.
    /// Called before serving dashboard/account-list reads.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let now = Utc::now();
        let accounts = self.accounts.list().await?;

        let stale_ids: Vec<String> = accounts
            .into_iter()
            .filter(|a| matches!(a.status, AccountStatus::RateLimited | AccountStatus::QuotaExceeded))
            .filter(|a| a.reset_at.map(|reset_at| reset_at <= now).unwrap_or(true))
            .map(|a| a.id)
            .collect();

        if stale_ids.is_empty() {
            return Ok(0);
        }

        self.accounts.bulk_clear_to_active(&stale_ids).await?;
        self.snapshot.invalidate();
        Ok(stale_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{InMemoryAccountStore, NewAccount, PlanType};
    use crate::mark::MarkEngine;
    use crate::settings::DashboardSettingsStore;
    use crate::usage::InMemoryUsageStore;
    use chrono::Duration;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    async fn setup() -> (Reconciler, Arc<InMemoryAccountStore>) {
        let accounts = Arc::new(InMemoryAccountStore::new());
        let dir = tempdir().unwrap();
        let settings = Arc::new(DashboardSettingsStore::open(&dir.path().join("settings.db")).unwrap());
        let usage = Arc::new(InMemoryUsageStore::new());
        let config = crate::config::Config::for_tests(PathBuf::from(dir.path()));
        let generation = Arc::new(AtomicU64::new(0));
        let mark = Arc::new(MarkEngine::new(accounts.clone(), settings, usage.clone(), generation.clone(), &config));
        let snapshot = Arc::new(SnapshotBuilder::new(accounts.clone(), usage, mark, generation, std::time::Duration::from_secs(5)));
        (Reconciler::new(accounts.clone(), snapshot), accounts)
    }

    async fn seed(accounts: &InMemoryAccountStore, id: &str, status: AccountStatus, reset_at: Option<chrono::DateTime<Utc>>) {
        accounts
            .create(NewAccount {
                id: id.to_string(),
                email: None,
                plan_type: PlanType::Free,
                access_token_encrypted: "x".into(),
                refresh_token_encrypted: "y".into(),
                id_token_encrypted: None,
                access_token_expires_at: Utc::now(),
            })
            .await
            .unwrap();
        accounts.update_status(id, status, reset_at, None).await.unwrap();
    }

    #[tokio::test]
    async fn clears_accounts_past_their_reset_at() {
        let (reconciler, accounts) = setup().await;
        seed(&accounts, "a", AccountStatus::RateLimited, Some(Utc::now() - Duration::minutes(1))).await;
        let cleared = reconciler.reconcile().await.unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(accounts.get_by_id("a").await.unwrap().unwrap().status, AccountStatus::Active);
    }

    #[tokio::test]
    async fn leaves_still_blocked_accounts_alone() {
        let (reconciler, accounts) = setup().await;
        seed(&accounts, "a", AccountStatus::RateLimited, Some(Utc::now() + Duration::minutes(5))).await;
        let cleared = reconciler.reconcile().await.unwrap();
        assert_eq!(cleared, 0);
        assert_eq!(accounts.get_by_id("a").await.unwrap().unwrap().status, AccountStatus::RateLimited);
    }

    #[tokio::test]
    async fn active_accounts_are_not_touched() {
        let (reconciler, accounts) = setup().await;
        seed(&accounts, "a", AccountStatus::Active, None).await;
        let cleared = reconciler.reconcile().await.unwrap();
        assert_eq!(cleared, 0);
    }
}
