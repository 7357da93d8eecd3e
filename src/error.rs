//! Internal error taxonomy and the OpenAI-shaped error envelope.
//!
//! Every fallible operation in the proxy pipeline resolves to one of these
//! variants. The taxonomy is independent of wire format; `IntoResponse`
//! below is the only place that knows how to render it as an HTTP response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid authentication")]
    InvalidAuth,
    #[error("auth refresh failed: {0}")]
    AuthRefreshFailed(String),
    #[error("refresh token reused")]
    RefreshTokenReused,

    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("usage limit reached")]
    UsageLimitReached,

    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("insufficient quota")]
    InsufficientQuota,
    #[error("usage not included")]
    UsageNotIncluded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream timeout")]
    Timeout,
    #[error("stream incomplete")]
    StreamIncomplete,

    #[error("internal error: {0}")]
    Internal(String),
    #[error("no accounts available: {0}")]
    NoAccounts(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub r#type: &'static str,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ProxyError {
    /// HTTP status + OpenAI `type`/`code` pair for this error, per spec §7.
    pub fn status_and_code(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ProxyError::InvalidAuth => (StatusCode::UNAUTHORIZED, "invalid_request_error", "invalid_api_key"),
            ProxyError::AuthRefreshFailed(_) => {
                (StatusCode::UNAUTHORIZED, "invalid_request_error", "invalid_api_key")
            }
            ProxyError::RefreshTokenReused => {
                (StatusCode::UNAUTHORIZED, "invalid_request_error", "invalid_api_key")
            }
            ProxyError::RateLimitExceeded => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", "rate_limit_exceeded")
            }
            ProxyError::UsageLimitReached => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", "usage_limit_reached")
            }
            ProxyError::QuotaExceeded => {
                (StatusCode::FORBIDDEN, "insufficient_quota", "quota_exceeded")
            }
            ProxyError::InsufficientQuota => {
                (StatusCode::FORBIDDEN, "insufficient_quota", "insufficient_quota")
            }
            ProxyError::UsageNotIncluded => {
                (StatusCode::FORBIDDEN, "insufficient_quota", "usage_not_included")
            }
            ProxyError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", "invalid_request")
            }
            ProxyError::UpstreamUnavailable(_) => {
                (StatusCode::BAD_GATEWAY, "server_error", "upstream_unavailable")
            }
            ProxyError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "server_error", "timeout"),
            ProxyError::StreamIncomplete => {
                (StatusCode::BAD_GATEWAY, "server_error", "stream_incomplete")
            }
            ProxyError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal")
            }
            ProxyError::NoAccounts(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "server_error", "no_accounts")
            }
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (_, r#type, code) = self.status_and_code();
        ErrorEnvelope {
            error: ErrorBody {
                r#type,
                code,
                message: self.to_string(),
                param: None,
            },
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, _, _) = self.status_and_code();
        (status, Json(self.envelope())).into_response()
    }
}
