//! Snapshot Builder — assembles the read-only projection the Selection
//! Engine scores against (spec §4.F).
//!
//! Reads are lock-free: callers get a cloned `Arc<SelectionSnapshot>` off a
//! cached pointer. Rebuilds are serialized by `rebuild_lock` so concurrent
//! cache misses coalesce into a single fetch instead of stampeding the
//! stores.

use crate::account::{Account, AccountStore};
use crate::mark::{MarkEngine, RuntimeAccountState};
use crate::usage::{LatestUsage, UsageStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct AccountView {
    pub account: Account,
    pub usage: LatestUsage,
    pub runtime: RuntimeAccountState,
}

#[derive(Debug, Clone)]
pub struct SelectionSnapshot {
    pub accounts: Vec<AccountView>,
    pub built_at: DateTime<Utc>,
}

impl SelectionSnapshot {
    pub fn get(&self, account_id: &str) -> Option<&AccountView> {
        self.accounts.iter().find(|v| v.account.id == account_id)
    }
}

struct Cached {
    snapshot: Arc<SelectionSnapshot>,
    generation: u64,
}

pub struct SnapshotBuilder {
    accounts: Arc<dyn AccountStore>,
    usage: Arc<dyn UsageStore>,
    mark: Arc<MarkEngine>,
    generation: Arc<AtomicU64>,
    ttl: Duration,
    cached: RwLock<Option<Cached>>,
    rebuild_lock: Mutex<()>,
}

impl SnapshotBuilder {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        usage: Arc<dyn UsageStore>,
        mark: Arc<MarkEngine>,
        generation: Arc<AtomicU64>,
        ttl: Duration,
    ) -> Self {
        Self { accounts, usage, mark, generation, ttl, cached: RwLock::new(None), rebuild_lock: Mutex::new(()) }
    }

    /// Returns a cached snapshot if it is still within TTL and no mark event
    /// has bumped the generation counter since it was built; otherwise
    /// rebuilds (coalescing concurrent rebuilders behind `rebuild_lock`).
    pub async fn get(&self) -> anyhow::Result<Arc<SelectionSnapshot>> {
        if let Some(snapshot) = self.fresh_cached().await {
            return Ok(snapshot);
        }

        let _guard = self.rebuild_lock.lock().await;
        // Another task may have rebuilt while we waited for the lock.
        if let Some(snapshot) = self.fresh_cached().await {
            return Ok(snapshot);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let snapshot = Arc::new(self.build().await?);
        *self.cached.write().await = Some(Cached { snapshot: snapshot.clone(), generation });
        Ok(snapshot)
    }

    async fn fresh_cached(&self) -> Option<Arc<SelectionSnapshot>> {
        let cached = self.cached.read().await;
        let cached = cached.as_ref()?;
        if cached.generation != self.generation.load(Ordering::SeqCst) {
            return None;
        }
        if Utc::now() - cached.snapshot.built_at >= chrono::Duration::from_std(self.ttl).ok()? {
            return None;
        }
        Some(cached.snapshot.clone())
    }

    async fn build(&self) -> anyhow::Result<SelectionSnapshot> {
        let accounts = self.accounts.list().await?;
        let usage = self.usage.latest_primary_secondary_by_account().await?;

        for account in &accounts {
            self.mark.reconcile_one(&account.id, account.reset_at).await;
        }
        let runtime = self.mark.snapshot_runtime().await;

        let views = accounts
            .into_iter()
            .map(|account| {
                let account_usage = usage.get(&account.id).cloned().unwrap_or_default();
                let account_runtime = runtime.get(&account.id).cloned().unwrap_or_default();
                AccountView { account, usage: account_usage, runtime: account_runtime }
            })
            .collect();

        Ok(SelectionSnapshot { accounts: views, built_at: Utc::now() })
    }

    /// Forces the next `get()` to rebuild regardless of TTL, used by
    /// operator actions (pause/resume/delete) that bypass the Mark Engine.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{InMemoryAccountStore, NewAccount, PlanType};
    use crate::settings::DashboardSettingsStore;
    use crate::usage::InMemoryUsageStore;
    use std::path::PathBuf;
    use tempfile::tempdir;

    async fn new_builder(ttl: Duration) -> (SnapshotBuilder, Arc<InMemoryAccountStore>, Arc<AtomicU64>) {
        let accounts = Arc::new(InMemoryAccountStore::new());
        let usage = Arc::new(InMemoryUsageStore::new());
        let dir = tempdir().unwrap();
        let settings = Arc::new(DashboardSettingsStore::open(&dir.path().join("settings.db")).unwrap());
        let config = crate::config::Config::for_tests(PathBuf::from(dir.path()));
        let generation = Arc::new(AtomicU64::new(0));
        let mark = Arc::new(MarkEngine::new(
            accounts.clone(),
            settings,
            usage.clone(),
            generation.clone(),
            &config,
        ));
        let builder = SnapshotBuilder::new(accounts.clone(), usage, mark, generation.clone(), ttl);
        (builder, accounts, generation)
    }

    async fn seed(accounts: &InMemoryAccountStore, id: &str) {
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
    }

    #[tokio::test]
    async fn build_includes_all_accounts() {
        let (builder, accounts, _gen) = new_builder(Duration::from_secs(5)).await;
        seed(&accounts, "acc-1").await;
        seed(&accounts, "acc-2").await;
        let snapshot = builder.get().await.unwrap();
        assert_eq!(snapshot.accounts.len(), 2);
    }

    #[tokio::test]
    async fn cache_is_reused_within_ttl() {
        let (builder, accounts, _gen) = new_builder(Duration::from_secs(60)).await;
        seed(&accounts, "acc-1").await;
        let first = builder.get().await.unwrap();
        seed(&accounts, "acc-2").await; // not reflected without invalidation
        let second = builder.get().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.accounts.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let (builder, accounts, _gen) = new_builder(Duration::from_secs(60)).await;
        seed(&accounts, "acc-1").await;
        let first = builder.get().await.unwrap();
        seed(&accounts, "acc-2").await;
        builder.invalidate();
        let second = builder.get().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.accounts.len(), 2);
    }
}
