//! Proxy Pipeline — accepts inbound OpenAI-compatible requests, loops across
//! candidate accounts with retry/failover, streams upstream bytes with
//! prelude buffering, and records outcomes (spec §4.I).
//!
//! Grounded on the teacher's `chat_completions` waterfall in `api/proxy.rs`:
//! same build-request/dispatch/classify/continue shape, generalized from a
//! fallback-chain-of-providers model to a selection-engine-per-attempt model.

pub mod chat_adapter;
pub mod headers;
pub mod stream;

use crate::account::AccountStore;
use crate::config::{Config, StreamBufferMode};
use crate::error::ProxyError;
use crate::logs::{RequestLog, RequestLogBuffer, RequestOutcome};
use crate::mark::MarkEngine;
use crate::reconciler::Reconciler;
use crate::selection::{self, NoAccountsAvailable, Pool, RequestContext, Selection};
use crate::settings::DashboardSettingsStore;
use crate::sticky::{fingerprint_of, StickyStore};
use crate::snapshot::SnapshotBuilder;
use crate::token::TokenManager;
use crate::usage::UsageStore;

use async_stream::stream as body_stream;
use axum::{
    body::Body,
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::io::StreamReader;

const STICKY_TTL: std::time::Duration = std::time::Duration::from_secs(3600);
const SELECTION_EVENT_CAPACITY: usize = 500;

/// A post-selection side effect recorded for `/debug/lb/selection-events`.
#[derive(Debug, Clone)]
pub struct SelectionEvent {
    pub recorded_at: DateTime<Utc>,
    pub request_id: String,
    pub account_id: Option<String>,
    pub pool: Option<&'static str>,
    pub outcome: &'static str,
    pub fallback_from_pinned: bool,
}

/// Bounded ring buffer of recent selection outcomes, independent of the
/// request log buffer since it's a debug aid rather than durable history.
pub struct SelectionEventLog {
    events: AsyncMutex<VecDeque<SelectionEvent>>,
}

impl SelectionEventLog {
    pub fn new() -> Self {
        Self { events: AsyncMutex::new(VecDeque::with_capacity(SELECTION_EVENT_CAPACITY)) }
    }

    async fn record(&self, event: SelectionEvent) {
        let mut events = self.events.lock().await;
        if events.len() >= SELECTION_EVENT_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub async fn recent(&self, n: usize) -> Vec<SelectionEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(n).cloned().collect()
    }
}

impl Default for SelectionEventLog {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub config: Config,
    pub accounts: Arc<dyn AccountStore>,
    pub usage: Arc<dyn UsageStore>,
    pub settings: Arc<DashboardSettingsStore>,
    pub sticky: Arc<dyn StickyStore>,
    pub sticky_hmac_key: Vec<u8>,
    pub mark: Arc<MarkEngine>,
    pub tokens: Arc<TokenManager>,
    pub snapshot: Arc<SnapshotBuilder>,
    pub reconciler: Arc<Reconciler>,
    pub request_logs: Option<Arc<RequestLogBuffer>>,
    pub selection_events: SelectionEventLog,
    pub http: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/responses", post(native_responses_handler))
        .route("/responses/compact", post(compact_responses_handler))
        .route("/v1/responses", post(native_responses_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .with_state(state)
}

async fn native_responses_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let stream_requested = wants_stream(&headers, &body);
    run_pipeline(state, headers, body, stream_requested, None).await
}

async fn compact_responses_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    run_pipeline(state, headers, body, false, None).await
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let model = body.get("model").and_then(Value::as_str).unwrap_or("unknown").to_string();
    let stream_requested = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let responses_body = chat_adapter::chat_request_to_responses(body);
    run_pipeline(state, headers, responses_body, stream_requested, Some(model)).await
}

/// `GET /v1/models` rides the same selection/token machinery as any other
/// route but never fails over — a models listing failure is returned as-is.
async fn models_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let ctx = RequestContext { forced_account_id: headers::take_forced_account_id(&headers), sticky_fingerprint: None };
    let selection = match select_once(&state, &ctx).await {
        Ok(s) => s,
        Err(err) => return err.into_response(),
    };
    let token = match state.tokens.get_fresh_access_token(&selection.account_id).await {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };
    let url = format!("{}/models", state.config.upstream_base_url.trim_end_matches('/'));
    let upstream_headers = headers::build_upstream_headers(&headers, &token.access_token, &selection.account_id);
    match state.http.get(&url).headers(upstream_headers).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            match resp.bytes().await {
                Ok(bytes) => (status, bytes).into_response(),
                Err(e) => ProxyError::UpstreamUnavailable(e.to_string()).into_response(),
            }
        }
        Err(e) => ProxyError::UpstreamUnavailable(e.to_string()).into_response(),
    }
}

fn wants_stream(headers: &HeaderMap, body: &Value) -> bool {
    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        return true;
    }
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

fn no_accounts_error(no_accounts: &NoAccountsAvailable) -> ProxyError {
    let reasons: Vec<String> = no_accounts
        .ineligible_reasons
        .iter()
        .map(|(id, reason)| format!("{id}: {}", reason.as_str()))
        .collect();
    ProxyError::NoAccounts(reasons.join(", "))
}

async fn select_once(state: &AppState, ctx: &RequestContext) -> Result<Selection, ProxyError> {
    let snapshot = state.snapshot.get().await.map_err(|e| ProxyError::Internal(e.to_string()))?;
    let settings = state.settings.get().await.unwrap_or_default();
    let sticky_target = match &ctx.sticky_fingerprint {
        Some(fp) => state.sticky.get(fp).await.ok().flatten().map(|e| e.account_id),
        None => None,
    };
    selection::select(
        &snapshot,
        &settings,
        state.config.selection_strategy,
        ctx,
        sticky_target.as_deref(),
        Utc::now(),
    )
    .map_err(|no_accounts| no_accounts_error(&no_accounts))
}

/// Core attempt loop shared by every route. `adapter_model` is `Some(model)`
/// when the caller came in through `/v1/chat/completions`, so the response
/// (or each SSE chunk) is re-wrapped into Chat Completions shape.
async fn run_pipeline(
    state: Arc<AppState>,
    inbound_headers: HeaderMap,
    body: Value,
    stream_requested: bool,
    adapter_model: Option<String>,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let started_at = Instant::now();
    let requested_at = Utc::now();

    let forced_account_id = headers::take_forced_account_id(&inbound_headers);
    let prompt_cache_key = body.get("prompt_cache_key").and_then(Value::as_str);
    let sticky_fingerprint = prompt_cache_key.map(|key| fingerprint_of(key, &state.sticky_hmac_key));
    let ctx = RequestContext { forced_account_id: forced_account_id.clone(), sticky_fingerprint: sticky_fingerprint.clone() };

    let max_attempts = if forced_account_id.is_some() { 1 } else { state.config.proxy_max_attempts };
    let model = body.get("model").and_then(Value::as_str).map(|s| s.to_string());

    let mut last_error = ProxyError::NoAccounts("no attempts made".to_string());

    for _attempt in 0..max_attempts {
        let selection = match select_once(&state, &ctx).await {
            Ok(s) => s,
            Err(err) => {
                record_selection_event(&state, &request_id, None, "no_accounts").await;
                return err.into_response();
            }
        };

        let token = match state.tokens.get_fresh_access_token(&selection.account_id).await {
            Ok(t) => t,
            Err(ProxyError::AuthRefreshFailed(msg)) => {
                last_error = ProxyError::AuthRefreshFailed(msg);
                record_selection_event(&state, &request_id, Some(&selection), "auth_refresh_failed").await;
                continue;
            }
            Err(e) => {
                last_error = e;
                record_selection_event(&state, &request_id, Some(&selection), "token_error").await;
                continue;
            }
        };

        let upstream_path = if stream_requested { "responses" } else { "responses/compact" };
        let url = format!("{}/{}", state.config.upstream_base_url.trim_end_matches('/'), upstream_path);
        let upstream_headers = headers::build_upstream_headers(&inbound_headers, &token.access_token, &selection.account_id);

        let mut request = state.http.post(&url).headers(upstream_headers).json(&body);
        if !stream_requested {
            request = request.timeout(state.config.proxy_compact_timeout);
        }
        let response = request.send().await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                state.mark.mark_transient_error(&selection.account_id).await;
                last_error = ProxyError::UpstreamUnavailable(e.to_string());
                record_selection_event(&state, &request_id, Some(&selection), "transport_error").await;
                continue;
            }
        };

        if !stream_requested {
            match handle_compact_response(&state, &selection, response).await {
                CompactOutcome::Success(mut value) => {
                    apply_sticky_update(&state, &sticky_fingerprint, &selection.account_id).await;
                    if let Some(model) = &adapter_model {
                        value = chat_adapter::responses_body_to_chat_completion(model, &value);
                    }
                    log_request(&state, &request_id, Some(&selection.account_id), requested_at, started_at, RequestOutcome::Ok, None, None, model.clone(), sticky_fingerprint.clone()).await;
                    record_selection_event(&state, &request_id, Some(&selection), "success").await;
                    return Json(value).into_response();
                }
                CompactOutcome::Retry(err) => {
                    last_error = err;
                    record_selection_event(&state, &request_id, Some(&selection), "retry").await;
                    continue;
                }
                CompactOutcome::Terminal(err) => {
                    log_request(&state, &request_id, Some(&selection.account_id), requested_at, started_at, outcome_for_error(&err), Some(err.status_and_code().2.to_string()), Some(err.to_string()), model.clone(), sticky_fingerprint.clone()).await;
                    record_selection_event(&state, &request_id, Some(&selection), "terminal_error").await;
                    return err.into_response();
                }
            }
        }

        if !response.status().is_success() {
            match classify_failed_response(response).await {
                Classification::Retry(err, hint) => {
                    apply_mark_for(&state, &selection.account_id, &err, hint).await;
                    last_error = err;
                    record_selection_event(&state, &request_id, Some(&selection), "retry").await;
                    continue;
                }
                Classification::Terminal(err) => {
                    log_request(&state, &request_id, Some(&selection.account_id), requested_at, started_at, outcome_for_error(&err), Some(err.status_and_code().2.to_string()), Some(err.to_string()), model.clone(), sticky_fingerprint.clone()).await;
                    record_selection_event(&state, &request_id, Some(&selection), "terminal_error").await;
                    return err.into_response();
                }
            }
        }

        match stream_attempt(&state, response, adapter_model.clone()).await {
            StreamAttemptOutcome::Committed(resp) => {
                state.mark.mark_success(&selection.account_id).await;
                apply_sticky_update(&state, &sticky_fingerprint, &selection.account_id).await;
                log_request(&state, &request_id, Some(&selection.account_id), requested_at, started_at, RequestOutcome::Ok, None, None, model.clone(), sticky_fingerprint.clone()).await;
                record_selection_event(&state, &request_id, Some(&selection), "success").await;
                return resp;
            }
            StreamAttemptOutcome::RetryBeforeFlush => {
                state.mark.mark_transient_error(&selection.account_id).await;
                last_error = ProxyError::UpstreamUnavailable("stream ended before prelude flush".to_string());
                record_selection_event(&state, &request_id, Some(&selection), "retry").await;
                continue;
            }
        }
    }

    log_request(&state, &request_id, None, requested_at, started_at, outcome_for_error(&last_error), Some(last_error.status_and_code().2.to_string()), Some(last_error.to_string()), model, sticky_fingerprint).await;
    last_error.into_response()
}

enum CompactOutcome {
    Success(Value),
    Retry(ProxyError),
    Terminal(ProxyError),
}

async fn handle_compact_response(state: &AppState, selection: &Selection, response: reqwest::Response) -> CompactOutcome {
    let status = response.status();
    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return CompactOutcome::Terminal(ProxyError::UpstreamUnavailable(format!("malformed response body: {e}"))),
    };

    if status.is_success() {
        state.mark.mark_success(&selection.account_id).await;
        return CompactOutcome::Success(body);
    }

    match classify_body(status, &body) {
        Classification::Retry(err, hint) => {
            apply_mark_for(state, &selection.account_id, &err, hint).await;
            CompactOutcome::Retry(err)
        }
        Classification::Terminal(err) => CompactOutcome::Terminal(err),
    }
}

enum Classification {
    Retry(ProxyError, Option<DateTime<Utc>>),
    Terminal(ProxyError),
}

async fn classify_failed_response(response: reqwest::Response) -> Classification {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    classify_body(status, &body)
}

/// Maps an upstream status code (and, where the status is ambiguous, a body
/// error code) to a retry-or-surface classification (spec §4.I step 2.d,
/// §7 propagation policy). The optional reset hint, when upstream reports
/// one, is forwarded to the Mark Engine so a far hint can persist status
/// immediately instead of waiting on the escalation streak.
fn classify_body(status: reqwest::StatusCode, body: &Value) -> Classification {
    let error_code = body.get("error").and_then(|e| e.get("code")).and_then(Value::as_str).unwrap_or("");
    let reset_hint = body
        .get("error")
        .and_then(|e| e.get("reset_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    match status.as_u16() {
        429 if error_code == "usage_limit_reached" => Classification::Retry(ProxyError::UsageLimitReached, reset_hint),
        429 => Classification::Retry(ProxyError::RateLimitExceeded, reset_hint),
        403 if matches!(error_code, "quota_exceeded" | "insufficient_quota" | "usage_not_included") => {
            Classification::Retry(ProxyError::QuotaExceeded, reset_hint)
        }
        401 => Classification::Retry(ProxyError::RateLimitExceeded, None), // transient: token appeared fresh but upstream rejected it
        500..=599 => Classification::Retry(ProxyError::UpstreamUnavailable(format!("upstream returned {status}")), None),
        403 => Classification::Terminal(ProxyError::InvalidRequest("insufficient_permissions".to_string())),
        404 => Classification::Terminal(ProxyError::InvalidRequest("not_found".to_string())),
        _ => Classification::Terminal(ProxyError::InvalidRequest(format!("upstream returned {status}"))),
    }
}

async fn apply_mark_for(state: &AppState, account_id: &str, err: &ProxyError, hint: Option<DateTime<Utc>>) {
    match err {
        ProxyError::RateLimitExceeded => state.mark.mark_rate_limit(account_id, hint).await,
        ProxyError::UsageLimitReached => state.mark.mark_usage_limit_reached(account_id, hint).await,
        ProxyError::QuotaExceeded => state.mark.mark_quota_exceeded(account_id).await,
        ProxyError::UpstreamUnavailable(_) | ProxyError::Timeout => state.mark.mark_transient_error(account_id).await,
        _ => {}
    }
}

fn outcome_for_error(err: &ProxyError) -> RequestOutcome {
    match err {
        ProxyError::RateLimitExceeded | ProxyError::UsageLimitReached => RequestOutcome::RateLimit,
        ProxyError::QuotaExceeded | ProxyError::InsufficientQuota | ProxyError::UsageNotIncluded => RequestOutcome::Quota,
        _ => RequestOutcome::Error,
    }
}

enum StreamAttemptOutcome {
    Committed(Response),
    RetryBeforeFlush,
}

/// Buffers the SSE prelude, then either commits the account (flush observed)
/// or signals the caller to retry silently on another one. When
/// `adapter_model` is `Some`, every Responses event from the prelude onward
/// is re-wrapped as a `chat.completion.chunk` before being forwarded, so a
/// streaming Chat Completions client never sees raw Responses events.
async fn stream_attempt(state: &AppState, response: reqwest::Response, adapter_model: Option<String>) -> StreamAttemptOutcome {
    if state.config.stream_buffer_mode == StreamBufferMode::Off {
        let body = Body::from_stream(response.bytes_stream());
        return StreamAttemptOutcome::Committed(
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(body)
                .unwrap_or_else(|_| ProxyError::Internal("failed to build stream response".to_string()).into_response()),
        );
    }

    let byte_stream = response.bytes_stream().map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(byte_stream);

    let outcome = stream::buffer_prelude(
        &mut reader,
        state.config.stream_buffer_prelude_timeout,
        state.config.stream_buffer_prelude_max_bytes,
    )
    .await;

    let buffered = match outcome {
        Ok(stream::PreludeOutcome::Flushed { buffered }) => buffered,
        Ok(stream::PreludeOutcome::EndedBeforeFlush { .. }) => return StreamAttemptOutcome::RetryBeforeFlush,
        Err(_) => return StreamAttemptOutcome::RetryBeforeFlush,
    };

    let read_timeout = state.config.proxy_stream_read_timeout;

    let body = Body::from_stream(body_stream! {
        let mut pending = buffered;

        if let Some(model) = &adapter_model {
            let (events, consumed) = chat_adapter::parse_sse_events(&pending);
            let chunks: Vec<Value> = events.iter().filter_map(|e| chat_adapter::responses_event_to_chat_chunk(model, e)).collect();
            if !chunks.is_empty() {
                yield Ok::<Bytes, std::io::Error>(chat_adapter::chat_chunks_to_sse(&chunks));
            }
            pending.drain(..consumed);
        } else if !pending.is_empty() {
            yield Ok::<Bytes, std::io::Error>(Bytes::from(std::mem::take(&mut pending)));
        }

        loop {
            let mut chunk = [0u8; 8192];
            use tokio::io::AsyncReadExt;
            match tokio::time::timeout(read_timeout, reader.read(&mut chunk)).await {
                Ok(Ok(0)) => {
                    if adapter_model.is_some() {
                        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                    }
                    break;
                }
                Ok(Ok(n)) => {
                    pending.extend_from_slice(&chunk[..n]);
                    if let Some(model) = &adapter_model {
                        let (events, consumed) = chat_adapter::parse_sse_events(&pending);
                        let chunks: Vec<Value> = events.iter().filter_map(|e| chat_adapter::responses_event_to_chat_chunk(model, e)).collect();
                        if !chunks.is_empty() {
                            yield Ok(chat_adapter::chat_chunks_to_sse(&chunks));
                        }
                        pending.drain(..consumed);
                    } else {
                        yield Ok(Bytes::from(std::mem::take(&mut pending)));
                    }
                }
                Ok(Err(_)) | Err(_) => {
                    yield Ok(Bytes::from_static(b"event: error\ndata: {\"error\":{\"type\":\"server_error\",\"code\":\"stream_incomplete\"}}\n\n"));
                    yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                    break;
                }
            }
        }
    });

    StreamAttemptOutcome::Committed(
        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .body(body)
            .unwrap_or_else(|_| ProxyError::Internal("failed to build stream response".to_string()).into_response()),
    )
}

async fn apply_sticky_update(state: &AppState, fingerprint: &Option<String>, account_id: &str) {
    if let Some(fp) = fingerprint {
        let _ = state.sticky.put_with_ttl(fp, account_id, STICKY_TTL).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn log_request(
    state: &AppState,
    request_id: &str,
    account_id: Option<&str>,
    requested_at: DateTime<Utc>,
    started_at: Instant,
    outcome: RequestOutcome,
    error_code: Option<String>,
    error_message: Option<String>,
    model: Option<String>,
    sticky_fingerprint: Option<String>,
) {
    let Some(buffer) = &state.request_logs else { return };
    buffer
        .enqueue(RequestLog {
            request_id: request_id.to_string(),
            account_id: account_id.map(|s| s.to_string()),
            requested_at,
            latency_ms: started_at.elapsed().as_millis() as u64,
            status: outcome,
            error_code,
            error_message,
            model,
            reasoning_effort: None,
            input_tokens: None,
            output_tokens: None,
            codex_session_id: None,
            codex_conversation_id: None,
            sticky_fingerprint,
        })
        .await;
}

async fn record_selection_event(state: &AppState, request_id: &str, selection: Option<&Selection>, outcome: &'static str) {
    let (account_id, pool, fallback) = match selection {
        Some(s) => (Some(s.account_id.clone()), Some(pool_label(s.pool)), s.fallback_from_pinned),
        None => (None, None, false),
    };
    state
        .selection_events
        .record(SelectionEvent {
            recorded_at: Utc::now(),
            request_id: request_id.to_string(),
            account_id,
            pool,
            outcome,
            fallback_from_pinned: fallback,
        })
        .await;
}

fn pool_label(pool: Pool) -> &'static str {
    match pool {
        Pool::Forced => "forced",
        Pool::Pinned => "pinned",
        Pool::All => "all",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wants_stream_reads_body_flag() {
        let headers = HeaderMap::new();
        assert!(wants_stream(&headers, &json!({"stream": true})));
        assert!(!wants_stream(&headers, &json!({"stream": false})));
    }

    #[test]
    fn wants_stream_reads_accept_header() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", "text/event-stream".parse().unwrap());
        assert!(wants_stream(&headers, &json!({})));
    }

    #[test]
    fn classify_body_maps_usage_limit_reached() {
        let body = json!({"error": {"code": "usage_limit_reached"}});
        let classification = classify_body(reqwest::StatusCode::TOO_MANY_REQUESTS, &body);
        assert!(matches!(classification, Classification::Retry(ProxyError::UsageLimitReached, _)));
    }

    #[test]
    fn classify_body_surfaces_invalid_request_directly() {
        let classification = classify_body(reqwest::StatusCode::NOT_FOUND, &Value::Null);
        assert!(matches!(classification, Classification::Terminal(ProxyError::InvalidRequest(_))));
    }
}
