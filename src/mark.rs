//! Mark Engine — applies terminal request outcomes to runtime account state.
//!
//! `RuntimeAccountState` is the in-memory half of account health; the
//! persisted half (`status`, `reset_at`, `deactivation_reason`) lives in the
//! Account Store. Every mark call bumps the shared snapshot generation
//! counter so the Snapshot Builder rebuilds on next read (spec §4.H).

use crate::account::{AccountStatus, AccountStore, DeactivationReason};
use crate::config::Config;
use crate::settings::DashboardSettingsStore;
use crate::usage::UsageStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-account in-memory state not worth persisting on every change.
#[derive(Debug, Clone, Default)]
pub struct RuntimeAccountState {
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_selected_at: Option<DateTime<Utc>>,
    /// Ephemeral upstream-reported or backoff-derived reset estimate, not
    /// yet (or never) persisted to the account's `reset_at` column.
    pub reset_at_hint: Option<DateTime<Utc>>,
    /// Consecutive `usage_limit_reached` outcomes since the last success,
    /// used to gate when a far hint is trusted enough to persist.
    pub usage_limit_streak: u32,
}

impl RuntimeAccountState {
    pub fn is_in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    /// Drop a stale hint: if the persisted `reset_at` is later than what we
    /// are holding in memory, or our hint has already passed, the runtime
    /// hint carries no more information than the persisted record.
    fn reconcile_with_persisted(&mut self, persisted_reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        if let Some(hint) = self.reset_at_hint {
            if hint <= now {
                self.reset_at_hint = None;
                self.cooldown_until = None;
            }
        }
        if let (Some(persisted), Some(hint)) = (persisted_reset_at, self.reset_at_hint) {
            if persisted > hint {
                self.reset_at_hint = Some(persisted);
                self.cooldown_until = Some(persisted);
            }
        }
    }
}

/// Exponential backoff used for transient errors and as the floor for
/// rate-limit cooldowns that carry no upstream hint.
fn exponential_backoff(error_count: u32) -> ChronoDuration {
    let base_secs = 5f64;
    let capped_minutes = 10f64;
    let delay = base_secs * 2f64.powi(error_count as i32);
    ChronoDuration::milliseconds((delay.min(capped_minutes * 60.0) * 1000.0) as i64)
}

pub struct MarkEngine {
    accounts: Arc<dyn AccountStore>,
    settings: Arc<DashboardSettingsStore>,
    usage: Arc<dyn UsageStore>,
    /// Bumped on every mark event; the Snapshot Builder compares this
    /// against the generation it last built from.
    generation: Arc<AtomicU64>,
    runtime: RwLock<HashMap<String, RuntimeAccountState>>,
    rate_limit_persist_threshold: ChronoDuration,
    usage_limit_min_cooldown: ChronoDuration,
    usage_limit_max_initial_cooldown: ChronoDuration,
    usage_limit_escalate_streak_threshold: u32,
}

impl MarkEngine {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        settings: Arc<DashboardSettingsStore>,
        usage: Arc<dyn UsageStore>,
        generation: Arc<AtomicU64>,
        config: &Config,
    ) -> Self {
        Self {
            accounts,
            settings,
            usage,
            generation,
            runtime: RwLock::new(HashMap::new()),
            rate_limit_persist_threshold: ChronoDuration::from_std(config.rate_limit_persist_threshold)
                .unwrap_or_else(|_| ChronoDuration::seconds(300)),
            usage_limit_min_cooldown: ChronoDuration::from_std(config.usage_limit_reached_min_cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(60)),
            usage_limit_max_initial_cooldown: ChronoDuration::from_std(
                config.usage_limit_reached_max_initial_cooldown,
            )
            .unwrap_or_else(|_| ChronoDuration::seconds(300)),
            usage_limit_escalate_streak_threshold: config.usage_limit_reached_escalate_streak_threshold,
        }
    }

    /// Seeds in-memory state for an account from its persisted `reset_at`,
    /// called during startup hydration (spec §5) and lazily on first touch.
    pub async fn hydrate(&self, account_id: &str, persisted_reset_at: Option<DateTime<Utc>>) {
        let mut runtime = self.runtime.write().await;
        let entry = runtime.entry(account_id.to_string()).or_default();
        if entry.reset_at_hint.is_none() {
            entry.reset_at_hint = persisted_reset_at;
            entry.cooldown_until = persisted_reset_at;
        }
    }

    pub async fn snapshot_runtime(&self) -> HashMap<String, RuntimeAccountState> {
        self.runtime.read().await.clone()
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn mark_success(&self, account_id: &str) {
        let now = Utc::now();
        {
            let mut runtime = self.runtime.write().await;
            let entry = runtime.entry(account_id.to_string()).or_default();
            entry.error_count = 0;
            entry.usage_limit_streak = 0;
            entry.last_selected_at = Some(now);
        }
        self.invalidate();
    }

    pub async fn mark_rate_limit(&self, account_id: &str, upstream_hint: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let (hint, error_count) = {
            let mut runtime = self.runtime.write().await;
            let entry = runtime.entry(account_id.to_string()).or_default();
            entry.error_count = entry.error_count.saturating_add(1);
            entry.last_error_at = Some(now);
            let backoff_floor = now + exponential_backoff(entry.error_count);
            let hint = upstream_hint.map(|h| h.max(backoff_floor)).unwrap_or(backoff_floor);
            entry.reset_at_hint = Some(hint);
            entry.cooldown_until = Some(hint);
            (hint, entry.error_count)
        };
        self.invalidate();

        let non_trivial = hint - now >= self.rate_limit_persist_threshold;
        if non_trivial && error_count > 0 {
            let _ = self
                .accounts
                .update_status(account_id, AccountStatus::RateLimited, Some(hint), None)
                .await;
        }
    }

    pub async fn mark_usage_limit_reached(&self, account_id: &str, upstream_hint: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let (hint, streak) = {
            let mut runtime = self.runtime.write().await;
            let entry = runtime.entry(account_id.to_string()).or_default();
            entry.usage_limit_streak = entry.usage_limit_streak.saturating_add(1);
            entry.last_error_at = Some(now);

            let hint = match upstream_hint {
                Some(h) => {
                    let capped = (h - now).min(self.usage_limit_max_initial_cooldown);
                    now + capped.max(self.usage_limit_min_cooldown)
                }
                None => now + self.usage_limit_min_cooldown,
            };
            entry.reset_at_hint = Some(hint);
            entry.cooldown_until = Some(hint);
            (hint, entry.usage_limit_streak)
        };
        self.invalidate();

        let streak_confirms = streak >= self.usage_limit_escalate_streak_threshold;
        let secondary_confirms = self.secondary_confirms_exhaustion(account_id).await;
        if streak_confirms || secondary_confirms {
            let persisted_reset = if secondary_confirms {
                self.latest_secondary_reset_at(account_id).await.unwrap_or(hint)
            } else {
                hint
            };
            let _ = self
                .accounts
                .update_status(account_id, AccountStatus::RateLimited, Some(persisted_reset), None)
                .await;
        }
    }

    pub async fn mark_quota_exceeded(&self, account_id: &str) {
        let reset_at = self.latest_secondary_reset_at(account_id).await;
        let _ = self
            .accounts
            .update_status(account_id, AccountStatus::QuotaExceeded, reset_at, None)
            .await;
        self.settings.remove_pinned_account(account_id).await.ok();
        self.invalidate();
    }

    pub async fn mark_permanent_failure(&self, account_id: &str, reason: DeactivationReason) {
        let _ = self
            .accounts
            .update_status(account_id, AccountStatus::Deactivated, None, Some(reason))
            .await;
        self.invalidate();
    }

    pub async fn mark_transient_error(&self, account_id: &str) {
        let now = Utc::now();
        {
            let mut runtime = self.runtime.write().await;
            let entry = runtime.entry(account_id.to_string()).or_default();
            entry.error_count = entry.error_count.saturating_add(1);
            entry.last_error_at = Some(now);
            let until = now + exponential_backoff(entry.error_count);
            entry.cooldown_until = Some(until);
        }
        self.invalidate();
    }

    async fn secondary_confirms_exhaustion(&self, account_id: &str) -> bool {
        self.usage
            .latest_primary_secondary_by_account()
            .await
            .ok()
            .and_then(|m| m.get(account_id).cloned())
            .and_then(|latest| latest.secondary)
            .map(|s| s.used_percent >= 100.0 && s.reset_at.is_some())
            .unwrap_or(false)
    }

    async fn latest_secondary_reset_at(&self, account_id: &str) -> Option<DateTime<Utc>> {
        self.usage
            .latest_primary_secondary_by_account()
            .await
            .ok()
            .and_then(|m| m.get(account_id).cloned())
            .and_then(|latest| latest.secondary)
            .and_then(|s| s.reset_at)
    }

    /// Reconciles one account's runtime hint against its persisted
    /// `reset_at`, called by the Snapshot Builder while assembling a
    /// projection (spec: "Reset when the persisted reset_at is later...").
    pub async fn reconcile_one(&self, account_id: &str, persisted_reset_at: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let mut runtime = self.runtime.write().await;
        let entry = runtime.entry(account_id.to_string()).or_default();
        entry.reconcile_with_persisted(persisted_reset_at, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{InMemoryAccountStore, NewAccount, PlanType};
    use crate::usage::InMemoryUsageStore;
    use tempfile::tempdir;

    async fn engine_with_account(account_id: &str) -> (MarkEngine, Arc<InMemoryAccountStore>) {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .create(NewAccount {
                id: account_id.to_string(),
                email: None,
                plan_type: PlanType::Plus,
                access_token_encrypted: "x".into(),
                refresh_token_encrypted: "y".into(),
                id_token_encrypted: None,
                access_token_expires_at: Utc::now(),
            })
            .await
            .unwrap();

        let dir = tempdir().unwrap().into_path();
        let settings = Arc::new(DashboardSettingsStore::open(&dir.join("settings.db")).unwrap());
        let usage = Arc::new(InMemoryUsageStore::new());
        let config = Config::for_tests(dir);
        let generation = Arc::new(AtomicU64::new(0));
        let engine = MarkEngine::new(accounts.clone(), settings, usage, generation, &config);
        (engine, accounts)
    }

    #[tokio::test]
    async fn success_resets_error_count() {
        let (engine, _accounts) = engine_with_account("acc-1").await;
        engine.mark_transient_error("acc-1").await;
        engine.mark_transient_error("acc-1").await;
        engine.mark_success("acc-1").await;
        let runtime = engine.snapshot_runtime().await;
        assert_eq!(runtime["acc-1"].error_count, 0);
    }

    #[tokio::test]
    async fn rate_limit_with_far_hint_persists_status() {
        let (engine, accounts) = engine_with_account("acc-1").await;
        let far_hint = Utc::now() + ChronoDuration::minutes(30);
        engine.mark_rate_limit("acc-1", Some(far_hint)).await;
        let account = accounts.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited);
        assert!(account.reset_at.is_some());
    }

    #[tokio::test]
    async fn usage_limit_without_hint_does_not_immediately_persist() {
        let (engine, accounts) = engine_with_account("acc-1").await;
        engine.mark_usage_limit_reached("acc-1", None).await;
        let account = accounts.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Active);
        let runtime = engine.snapshot_runtime().await;
        assert!(runtime["acc-1"].cooldown_until.is_some());
    }

    #[tokio::test]
    async fn usage_limit_streak_eventually_persists() {
        let (engine, accounts) = engine_with_account("acc-1").await;
        for _ in 0..3 {
            engine.mark_usage_limit_reached("acc-1", None).await;
        }
        let account = accounts.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::RateLimited);
    }

    #[tokio::test]
    async fn quota_exceeded_persists_and_unpins() {
        let (engine, accounts) = engine_with_account("acc-1").await;
        engine.settings.set_pinned_account_ids(vec!["acc-1".to_string()]).await.unwrap();
        engine.mark_quota_exceeded("acc-1").await;
        let account = accounts.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::QuotaExceeded);
        assert!(engine.settings.pinned_account_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_deactivates() {
        let (engine, accounts) = engine_with_account("acc-1").await;
        engine.mark_permanent_failure("acc-1", DeactivationReason::AuthRefreshFailed).await;
        let account = accounts.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(account.status, AccountStatus::Deactivated);
        assert_eq!(account.deactivation_reason, Some(DeactivationReason::AuthRefreshFailed));
    }
}
