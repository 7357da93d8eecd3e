//! Debug/ops HTTP surface — gated by `DEBUG_ENDPOINTS_ENABLED`, grounded on
//! the teacher's `ProviderHealthTracker::get_recent_events`/`get_health`
//! shape (spec §4.K "[FULL] Debug/ops surface").
//!
//! Also exposes the typed account/settings operations a dashboard would
//! call (`/api/accounts`, `/api/accounts/:id`, `/api/settings`); the
//! dashboard itself is named as an external collaborator and is not part of
//! this crate.

use crate::account::{AccountStatus, DeactivationReason};
use crate::error::ProxyError;
use crate::proxy::AppState;
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/debug/lb/selection-events", get(selection_events))
        .route("/debug/lb/health", get(health))
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/:id", patch(update_account).delete(delete_account))
        .route("/api/settings", get(get_settings).patch(update_settings))
        .with_state(state)
}

async fn require_debug_enabled(state: &AppState) -> Result<(), Response> {
    let enabled = state
        .settings
        .get()
        .await
        .map(|s| s.debug_endpoints_enabled)
        .unwrap_or(state.config.debug_endpoints_enabled);
    if enabled {
        Ok(())
    } else {
        Err(ProxyError::InvalidRequest("debug endpoints are disabled".to_string()).into_response())
    }
}

#[derive(Debug, Serialize)]
struct SelectionEventView {
    recorded_at: DateTime<Utc>,
    request_id: String,
    account_id: Option<String>,
    pool: Option<&'static str>,
    outcome: &'static str,
    fallback_from_pinned: bool,
}

/// Newest-last, matching the teacher's `get_recent_events` ordering.
async fn selection_events(State(state): State<Arc<AppState>>) -> Response {
    if let Err(resp) = require_debug_enabled(&state).await {
        return resp;
    }
    let mut events = state.selection_events.recent(200).await;
    events.reverse();
    let view: Vec<SelectionEventView> = events
        .into_iter()
        .map(|e| SelectionEventView {
            recorded_at: e.recorded_at,
            request_id: e.request_id,
            account_id: e.account_id,
            pool: e.pool,
            outcome: e.outcome,
            fallback_from_pinned: e.fallback_from_pinned,
        })
        .collect();
    Json(view).into_response()
}

#[derive(Debug, Serialize)]
struct AccountHealthView {
    account_id: String,
    status: &'static str,
    reset_at: Option<DateTime<Utc>>,
    deactivation_reason: Option<&'static str>,
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    if let Err(resp) = require_debug_enabled(&state).await {
        return resp;
    }
    let accounts = match state.accounts.list().await {
        Ok(a) => a,
        Err(e) => return ProxyError::Internal(e.to_string()).into_response(),
    };
    let view: Vec<AccountHealthView> = accounts
        .into_iter()
        .map(|a| AccountHealthView {
            account_id: a.id,
            status: a.status.as_str(),
            reset_at: a.reset_at,
            deactivation_reason: a.deactivation_reason.map(|r| r.as_str()),
        })
        .collect();
    Json(view).into_response()
}

#[derive(Debug, Serialize)]
struct AccountView {
    id: String,
    email: Option<String>,
    plan_type: &'static str,
    status: &'static str,
    reset_at: Option<DateTime<Utc>>,
    deactivation_reason: Option<&'static str>,
}

/// Triggers the Reconciler before listing so stale blocked accounts have
/// already converged back to `active` (spec §4.K).
async fn list_accounts(State(state): State<Arc<AppState>>) -> Response {
    if let Err(e) = state.reconciler.reconcile().await {
        tracing::warn!(error = %e, "reconcile before account listing failed");
    }
    let accounts = match state.accounts.list().await {
        Ok(a) => a,
        Err(e) => return ProxyError::Internal(e.to_string()).into_response(),
    };
    let view: Vec<AccountView> = accounts
        .into_iter()
        .map(|a| AccountView {
            id: a.id,
            email: a.email,
            plan_type: a.plan_type.as_str(),
            status: a.status.as_str(),
            reset_at: a.reset_at,
            deactivation_reason: a.deactivation_reason.map(|r| r.as_str()),
        })
        .collect();
    Json(view).into_response()
}

#[derive(Debug, Deserialize)]
struct UpdateAccountRequest {
    /// `"active"`, `"paused"`, or `"deactivated"` — the subset an operator
    /// may set directly; `rate_limited`/`quota_exceeded` are Mark Engine-only.
    status: Option<String>,
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAccountRequest>,
) -> Response {
    let Some(requested) = body.status else {
        return ProxyError::InvalidRequest("status is required".to_string()).into_response();
    };
    let status = match requested.as_str() {
        "active" => AccountStatus::Active,
        "paused" => AccountStatus::Paused,
        "deactivated" => AccountStatus::Deactivated,
        other => {
            return ProxyError::InvalidRequest(format!("cannot set status to {other} directly"))
                .into_response()
        }
    };
    let reason = match status {
        AccountStatus::Deactivated => Some(DeactivationReason::PermanentUpstreamFailure),
        _ => None,
    };
    if let Err(e) = state.accounts.update_status(&id, status, None, reason).await {
        return ProxyError::Internal(e.to_string()).into_response();
    }
    state.snapshot.invalidate();
    StatusCodeOk.into_response()
}

async fn delete_account(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.accounts.delete(&id).await {
        Ok(true) => {
            state.snapshot.invalidate();
            StatusCodeOk.into_response()
        }
        Ok(false) => ProxyError::InvalidRequest(format!("account {id} not found")).into_response(),
        Err(e) => ProxyError::Internal(e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct SettingsView {
    pinned_account_ids: Vec<String>,
    request_log_retention_days: u32,
    debug_endpoints_enabled: bool,
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    match state.settings.get().await {
        Ok(s) => Json(SettingsView {
            pinned_account_ids: s.pinned_account_ids,
            request_log_retention_days: s.request_log_retention_days,
            debug_endpoints_enabled: s.debug_endpoints_enabled,
        })
        .into_response(),
        Err(e) => ProxyError::Internal(e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    pinned_account_ids: Option<Vec<String>>,
    request_log_retention_days: Option<u32>,
    debug_endpoints_enabled: Option<bool>,
}

async fn update_settings(State(state): State<Arc<AppState>>, Json(body): Json<UpdateSettingsRequest>) -> Response {
    if let Some(ids) = body.pinned_account_ids {
        if let Err(e) = state.settings.set_pinned_account_ids(ids).await {
            return ProxyError::Internal(e.to_string()).into_response();
        }
        state.snapshot.invalidate();
    }
    if let Some(days) = body.request_log_retention_days {
        if let Err(e) = state.settings.set_request_log_retention_days(days).await {
            return ProxyError::Internal(e.to_string()).into_response();
        }
    }
    if let Some(enabled) = body.debug_endpoints_enabled {
        if let Err(e) = state.settings.set_debug_endpoints_enabled(enabled).await {
            return ProxyError::Internal(e.to_string()).into_response();
        }
    }
    get_settings(State(state)).await
}

/// A bare `200 OK` for operator actions that return nothing interesting.
struct StatusCodeOk;

impl IntoResponse for StatusCodeOk {
    fn into_response(self) -> Response {
        axum::http::StatusCode::OK.into_response()
    }
}
