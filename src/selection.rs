//! Selection Engine — the pure scoring function the Proxy Pipeline calls
//! once per attempt (spec §4.G). `select` takes a snapshot and a request
//! context and never touches a store directly, so it is trivially testable.

use crate::account::{AccountStatus, Tier};
use crate::config::SelectionStrategy;
use crate::settings::DashboardSettings;
use crate::snapshot::{AccountView, SelectionSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IneligibleReason {
    Paused,
    Deactivated,
    Cooldown,
    ErrorBackoff,
    RateLimited,
    QuotaExceeded,
    SecondaryExhausted,
}

impl IneligibleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Deactivated => "deactivated",
            Self::Cooldown => "cooldown",
            Self::ErrorBackoff => "error_backoff",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::SecondaryExhausted => "secondary_exhausted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Forced,
    Pinned,
    All,
}

#[derive(Debug, Default, Clone)]
pub struct RequestContext {
    pub forced_account_id: Option<String>,
    pub sticky_fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account_id: String,
    pub pool: Pool,
    pub fallback_from_pinned: bool,
    pub via_stickiness: bool,
}

#[derive(Debug, Clone)]
pub struct NoAccountsAvailable {
    pub ineligible_reasons: HashMap<String, IneligibleReason>,
}

pub type SelectResult = Result<Selection, NoAccountsAvailable>;

/// The sticky lookup is injected rather than queried inline because it is
/// itself async (`StickyStore::get`); the pure scoring core stays sync.
pub fn select(
    snapshot: &SelectionSnapshot,
    settings: &DashboardSettings,
    strategy: SelectionStrategy,
    ctx: &RequestContext,
    sticky_target: Option<&str>,
    now: DateTime<Utc>,
) -> SelectResult {
    if let Some(forced) = &ctx.forced_account_id {
        return match snapshot.get(forced) {
            Some(_) => Ok(Selection {
                account_id: forced.clone(),
                pool: Pool::Forced,
                fallback_from_pinned: false,
                via_stickiness: false,
            }),
            None => Err(NoAccountsAvailable { ineligible_reasons: HashMap::new() }),
        };
    }

    let pinned: Vec<&AccountView> = snapshot
        .accounts
        .iter()
        .filter(|v| settings.pinned_account_ids.iter().any(|id| id == &v.account.id))
        .collect();

    if !pinned.is_empty() {
        if let Some(selection) = try_pool(&pinned, Pool::Pinned, strategy, ctx, sticky_target, now, false) {
            return Ok(selection);
        }
        // Pinned pool exhausted: fall back to the full pool (spec §4.G step 6).
        let all: Vec<&AccountView> = snapshot.accounts.iter().collect();
        return try_pool(&all, Pool::All, strategy, ctx, sticky_target, now, true)
            .ok_or_else(|| NoAccountsAvailable { ineligible_reasons: ineligibility_breakdown(&all, now) });
    }

    let all: Vec<&AccountView> = snapshot.accounts.iter().collect();
    try_pool(&all, Pool::All, strategy, ctx, sticky_target, now, false)
        .ok_or_else(|| NoAccountsAvailable { ineligible_reasons: ineligibility_breakdown(&all, now) })
}

fn try_pool(
    candidates: &[&AccountView],
    pool: Pool,
    strategy: SelectionStrategy,
    ctx: &RequestContext,
    sticky_target: Option<&str>,
    now: DateTime<Utc>,
    fallback_from_pinned: bool,
) -> Option<Selection> {
    let eligible: Vec<&AccountView> =
        candidates.iter().filter(|v| is_eligible(v, now)).copied().collect();

    if ctx.sticky_fingerprint.is_some() {
        if let Some(target) = sticky_target {
            if eligible.iter().any(|v| v.account.id == target) {
                return Some(Selection {
                    account_id: target.to_string(),
                    pool,
                    fallback_from_pinned,
                    via_stickiness: true,
                });
            }
        }
    }

    if eligible.is_empty() {
        return None;
    }

    let winner = score_and_pick(&eligible, strategy, now)?;
    Some(Selection {
        account_id: winner.account.id.clone(),
        pool,
        fallback_from_pinned,
        via_stickiness: false,
    })
}

pub fn is_eligible(view: &AccountView, now: DateTime<Utc>) -> bool {
    ineligible_reason(view, now).is_none()
}

pub fn ineligible_reason(view: &AccountView, now: DateTime<Utc>) -> Option<IneligibleReason> {
    match view.account.status {
        AccountStatus::Paused => return Some(IneligibleReason::Paused),
        AccountStatus::Deactivated => return Some(IneligibleReason::Deactivated),
        AccountStatus::Active | AccountStatus::RateLimited | AccountStatus::QuotaExceeded => {}
    }

    if view.runtime.cooldown_until.map(|until| until > now).unwrap_or(false) {
        return Some(IneligibleReason::ErrorBackoff);
    }

    if matches!(view.account.status, AccountStatus::RateLimited | AccountStatus::QuotaExceeded) {
        let effective_reset_at = [view.account.reset_at, view.runtime.reset_at_hint]
            .into_iter()
            .flatten()
            .max();
        if let Some(effective) = effective_reset_at {
            if effective > now {
                return Some(if view.account.status == AccountStatus::QuotaExceeded {
                    IneligibleReason::QuotaExceeded
                } else {
                    IneligibleReason::RateLimited
                });
            }
        }
    }

    if let Some(secondary) = &view.usage.secondary {
        if secondary.used_percent >= 100.0 {
            if let Some(reset_at) = secondary.reset_at {
                if reset_at > now {
                    return Some(IneligibleReason::SecondaryExhausted);
                }
            }
        }
    }

    None
}

fn ineligibility_breakdown(
    candidates: &[&AccountView],
    now: DateTime<Utc>,
) -> HashMap<String, IneligibleReason> {
    candidates
        .iter()
        .filter_map(|v| ineligible_reason(v, now).map(|reason| (v.account.id.clone(), reason)))
        .collect()
}

fn score_and_pick<'a>(
    eligible: &[&'a AccountView],
    strategy: SelectionStrategy,
    now: DateTime<Utc>,
) -> Option<&'a AccountView> {
    match strategy {
        SelectionStrategy::TierWeightedResetFirst => tier_weighted_reset_first(eligible, now),
        SelectionStrategy::HybridWastePressure => hybrid_waste_pressure(eligible, now),
    }
}

fn secondary_reset_at(view: &AccountView) -> Option<DateTime<Utc>> {
    view.usage.secondary.as_ref().and_then(|s| s.reset_at)
}

fn tier_weighted_reset_first<'a>(
    eligible: &[&'a AccountView],
    now: DateTime<Utc>,
) -> Option<&'a AccountView> {
    eligible
        .iter()
        .copied()
        .max_by(|a, b| {
            score_tier_weighted(a, now)
                .partial_cmp(&score_tier_weighted(b, now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tie_break(a, b, now))
        })
}

fn score_tier_weighted(view: &AccountView, now: DateTime<Utc>) -> f64 {
    let tier = view.account.plan_type.tier();
    match secondary_reset_at(view) {
        Some(reset_at) => {
            let seconds = (reset_at - now).num_seconds().max(60) as f64;
            tier.weight() / seconds
        }
        None => 0.0,
    }
}

fn hybrid_waste_pressure<'a>(
    eligible: &[&'a AccountView],
    now: DateTime<Utc>,
) -> Option<&'a AccountView> {
    let mut by_tier: HashMap<Tier, Vec<&AccountView>> = HashMap::new();
    for view in eligible {
        by_tier.entry(view.account.plan_type.tier()).or_default().push(view);
    }

    let mut best_tier: Option<(Tier, f64)> = None;
    for (tier, views) in &by_tier {
        let tier_required_rate =
            views.iter().map(|v| required_rate(v, now)).fold(0.0, f64::max);
        let tier_score = tier_required_rate * tier.weight();
        if best_tier.map(|(_, score)| tier_score > score).unwrap_or(true) {
            best_tier = Some((*tier, tier_score));
        }
    }

    let (winning_tier, _) = best_tier?;
    by_tier.get(&winning_tier)?.iter().copied().max_by(|a, b| {
        required_rate(a, now)
            .partial_cmp(&required_rate(b, now))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_break(a, b, now))
    })
}

fn required_rate(view: &AccountView, now: DateTime<Utc>) -> f64 {
    let remaining_credits = view
        .usage
        .secondary
        .as_ref()
        .and_then(|s| s.capacity_credits.map(|capacity| capacity * (1.0 - s.used_percent / 100.0)))
        .unwrap_or(0.0);
    match secondary_reset_at(view) {
        Some(reset_at) => {
            let seconds = (reset_at - now).num_seconds().max(60) as f64;
            remaining_credits / seconds
        }
        None => 0.0,
    }
}

/// Tie-break order: earlier known `secondary_reset_at`, then higher tier
/// weight, then older `last_selected_at`, then lexical account id.
fn tie_break(a: &AccountView, b: &AccountView, _now: DateTime<Utc>) -> std::cmp::Ordering {
    let reset_cmp = match (secondary_reset_at(a), secondary_reset_at(b)) {
        (Some(ra), Some(rb)) => rb.cmp(&ra), // earlier reset wins -> reverse for max_by
        (Some(_), None) => std::cmp::Ordering::Greater,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (None, None) => std::cmp::Ordering::Equal,
    };
    if reset_cmp != std::cmp::Ordering::Equal {
        return reset_cmp;
    }

    let tier_cmp = a.account.plan_type.tier().cmp(&b.account.plan_type.tier());
    if tier_cmp != std::cmp::Ordering::Equal {
        return tier_cmp;
    }

    let last_selected_cmp = match (a.runtime.last_selected_at, b.runtime.last_selected_at) {
        (Some(la), Some(lb)) => lb.cmp(&la), // older wins -> reverse for max_by
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    };
    if last_selected_cmp != std::cmp::Ordering::Equal {
        return last_selected_cmp;
    }

    // lexical account_id, reversed so the lexically-smaller id wins max_by
    b.account.id.cmp(&a.account.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountStatus, PlanType};
    use crate::mark::RuntimeAccountState;
    use crate::usage::{LatestUsage, UsageSample, Window};
    use chrono::Duration;

    fn account(id: &str, plan: PlanType, status: AccountStatus) -> Account {
        Account {
            id: id.to_string(),
            email: None,
            plan_type: plan,
            access_token_encrypted: String::new(),
            refresh_token_encrypted: String::new(),
            id_token_encrypted: None,
            access_token_expires_at: Utc::now() + Duration::hours(1),
            status,
            deactivation_reason: None,
            reset_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn view(account: Account, secondary_reset_in_secs: Option<i64>, used_percent: f64) -> AccountView {
        let secondary = secondary_reset_in_secs.map(|secs| UsageSample {
            account_id: account.id.clone(),
            window: Window::Secondary,
            recorded_at: Utc::now(),
            used_percent,
            reset_at: Some(Utc::now() + Duration::seconds(secs)),
            window_minutes: 10080,
            capacity_credits: Some(1000.0),
        });
        AccountView {
            account,
            usage: LatestUsage { primary: None, secondary },
            runtime: RuntimeAccountState::default(),
        }
    }

    fn snapshot(views: Vec<AccountView>) -> SelectionSnapshot {
        SelectionSnapshot { accounts: views, built_at: Utc::now() }
    }

    fn no_pins() -> DashboardSettings {
        DashboardSettings { pinned_account_ids: vec![], request_log_retention_days: 30, debug_endpoints_enabled: false }
    }

    #[test]
    fn picks_highest_scoring_eligible_account() {
        let a = view(account("a", PlanType::Free, AccountStatus::Active), Some(3600), 10.0);
        let b = view(account("b", PlanType::Pro, AccountStatus::Active), Some(3600), 10.0);
        let snap = snapshot(vec![a, b]);
        let result = select(
            &snap,
            &no_pins(),
            SelectionStrategy::TierWeightedResetFirst,
            &RequestContext::default(),
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(result.account_id, "b"); // pro has higher tier weight
    }

    #[test]
    fn forced_account_bypasses_eligibility() {
        let a = view(account("a", PlanType::Free, AccountStatus::Deactivated), None, 0.0);
        let snap = snapshot(vec![a]);
        let ctx = RequestContext { forced_account_id: Some("a".to_string()), sticky_fingerprint: None };
        let result =
            select(&snap, &no_pins(), SelectionStrategy::TierWeightedResetFirst, &ctx, None, Utc::now())
                .unwrap();
        assert_eq!(result.account_id, "a");
        assert_eq!(result.pool, Pool::Forced);
    }

    #[test]
    fn sticky_entry_wins_when_target_eligible() {
        let a = view(account("a", PlanType::Pro, AccountStatus::Active), Some(3600), 10.0);
        let b = view(account("b", PlanType::Pro, AccountStatus::Active), Some(3600), 10.0);
        let snap = snapshot(vec![a, b]);
        let ctx = RequestContext { forced_account_id: None, sticky_fingerprint: Some("fp".to_string()) };
        let result = select(
            &snap,
            &no_pins(),
            SelectionStrategy::TierWeightedResetFirst,
            &ctx,
            Some("a"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(result.account_id, "a");
        assert!(result.via_stickiness);
    }

    #[test]
    fn secondary_exhausted_account_is_ineligible() {
        let a = view(account("a", PlanType::Pro, AccountStatus::Active), Some(3600), 100.0);
        let snap = snapshot(vec![a]);
        let result = select(
            &snap,
            &no_pins(),
            SelectionStrategy::TierWeightedResetFirst,
            &RequestContext::default(),
            None,
            Utc::now(),
        );
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.ineligible_reasons["a"], IneligibleReason::SecondaryExhausted);
    }

    #[test]
    fn pinned_pool_exhaustion_falls_back_to_full_pool() {
        let pinned = view(account("pinned", PlanType::Free, AccountStatus::Deactivated), None, 0.0);
        let other = view(account("other", PlanType::Pro, AccountStatus::Active), Some(3600), 10.0);
        let snap = snapshot(vec![pinned, other]);
        let mut settings = no_pins();
        settings.pinned_account_ids = vec!["pinned".to_string()];
        let result =
            select(&snap, &settings, SelectionStrategy::TierWeightedResetFirst, &RequestContext::default(), None, Utc::now())
                .unwrap();
        assert_eq!(result.account_id, "other");
        assert!(result.fallback_from_pinned);
    }

    #[test]
    fn no_eligible_accounts_returns_breakdown() {
        let a = view(account("a", PlanType::Free, AccountStatus::Paused), None, 0.0);
        let snap = snapshot(vec![a]);
        let result = select(
            &snap,
            &no_pins(),
            SelectionStrategy::TierWeightedResetFirst,
            &RequestContext::default(),
            None,
            Utc::now(),
        );
        assert_eq!(result.unwrap_err().ineligible_reasons["a"], IneligibleReason::Paused);
    }
}
