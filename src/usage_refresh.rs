//! Usage Refresh Loop — polls the upstream usage endpoint per account on a
//! fixed interval with bounded concurrency (spec §4.J).

use crate::account::{Account, AccountStatus, AccountStore};
use crate::mark::MarkEngine;
use crate::snapshot::SnapshotBuilder;
use crate::token::TokenManager;
use crate::usage::{UsageSample, UsageStore, Window};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct UsageWindowResponse {
    used_percent: f64,
    reset_at: Option<DateTime<Utc>>,
    window_minutes: i64,
    #[serde(default)]
    capacity_credits: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    primary: Option<UsageWindowResponse>,
    #[serde(default)]
    secondary: Option<UsageWindowResponse>,
}

pub struct UsageRefresher {
    accounts: Arc<dyn AccountStore>,
    usage: Arc<dyn UsageStore>,
    tokens: Arc<TokenManager>,
    mark: Arc<MarkEngine>,
    snapshot: Arc<SnapshotBuilder>,
    http: reqwest::Client,
    upstream_base_url: String,
    concurrency: usize,
}

impl UsageRefresher {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        usage: Arc<dyn UsageStore>,
        tokens: Arc<TokenManager>,
        mark: Arc<MarkEngine>,
        snapshot: Arc<SnapshotBuilder>,
        http: reqwest::Client,
        upstream_base_url: String,
        concurrency: usize,
    ) -> Self {
        Self { accounts, usage, tokens, mark, snapshot, http, upstream_base_url, concurrency }
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let accounts = match self.accounts.list().await {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::warn!(error = %e, "usage refresh: failed to list accounts");
                return;
            }
        };

        let candidates: Vec<Account> = accounts
            .into_iter()
            .filter(|a| a.status != AccountStatus::Deactivated && a.status != AccountStatus::Paused)
            .collect();

        let mut changed_any = false;
        let results: Vec<bool> = stream::iter(candidates)
            .map(|account| self.refresh_one(account))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        changed_any |= results.into_iter().any(|changed| changed);

        if changed_any {
            self.snapshot.invalidate();
        }
    }

    /// Returns whether this account's usage shape changed meaningfully
    /// enough to justify an eager snapshot invalidation.
    async fn refresh_one(&self, account: Account) -> bool {
        let token = match self.tokens.get_fresh_access_token(&account.id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %e, "usage refresh: token refresh failed");
                return false;
            }
        };

        let url = format!("{}/wham/usage", self.upstream_base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token.access_token)
            .header("chatgpt-account-id", &account.id)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %e, "usage refresh: request failed");
                self.mark.mark_transient_error(&account.id).await;
                return false;
            }
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            self.mark.mark_transient_error(&account.id).await;
            return false;
        }
        if !response.status().is_success() {
            self.mark.mark_transient_error(&account.id).await;
            return false;
        }

        let body: UsageResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %e, "usage refresh: malformed response");
                return false;
            }
        };

        let now = Utc::now();
        let mut appended = false;

        // Each window is appended independently; a missing window is simply
        // skipped rather than guessed (spec §9 open question resolution).
        if let Some(primary) = body.primary {
            let sample = UsageSample {
                account_id: account.id.clone(),
                window: Window::Primary,
                recorded_at: now,
                used_percent: primary.used_percent,
                reset_at: primary.reset_at,
                window_minutes: primary.window_minutes,
                capacity_credits: primary.capacity_credits,
            }
            .normalized();
            if self.usage.append(sample).await.is_ok() {
                appended = true;
            }
        }

        let mut secondary_exhausted = false;
        let mut secondary_clear = false;
        if let Some(secondary) = body.secondary {
            secondary_exhausted = secondary.used_percent >= 100.0 && secondary.reset_at.is_some();
            secondary_clear = secondary.used_percent < 100.0;
            let sample = UsageSample {
                account_id: account.id.clone(),
                window: Window::Secondary,
                recorded_at: now,
                used_percent: secondary.used_percent,
                reset_at: secondary.reset_at,
                window_minutes: secondary.window_minutes,
                capacity_credits: secondary.capacity_credits,
            }
            .normalized();
            if self.usage.append(sample).await.is_ok() {
                appended = true;
            }
        }

        if secondary_exhausted {
            self.mark.mark_quota_exceeded(&account.id).await;
        } else if secondary_clear && account.status == AccountStatus::QuotaExceeded {
            let _ = self.accounts.update_status(&account.id, AccountStatus::Active, None, None).await;
            appended = true;
        }

        appended
    }
}
