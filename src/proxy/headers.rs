//! Inbound→upstream header filtering (spec §4.I).

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Headers dropped when copying the inbound request to the upstream one.
/// Proxy identity and routing headers never forward; the debug force-account
/// header is ingress-only and must never leak upstream either.
const DROPPED_EXACT: &[&str] = &[
    "authorization",
    "host",
    "content-length",
    "forwarded",
    "x-real-ip",
    "true-client-ip",
    "x-codex-lb-force-account-id",
];

const DROPPED_PREFIXES: &[&str] = &["x-forwarded-", "cf-"];

fn is_dropped(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    DROPPED_EXACT.contains(&lower.as_str()) || DROPPED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Builds the upstream header set: inbound headers minus the dropped set,
/// plus a fresh `Authorization: Bearer` and `chatgpt-account-id`.
pub fn build_upstream_headers(inbound: &HeaderMap, access_token: &str, account_id: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if is_dropped(name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {access_token}")) {
        out.insert(HeaderName::from_static("authorization"), value);
    }
    if let Ok(value) = HeaderValue::from_str(account_id) {
        out.insert(HeaderName::from_static("chatgpt-account-id"), value);
    }
    out
}

/// Extracts and removes the debug force-account header from the inbound
/// set, since it must never be forwarded upstream.
pub fn take_forced_account_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-codex-lb-force-account-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_proxy_identity_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert("authorization", HeaderValue::from_static("Bearer client-key"));
        inbound.insert("host", HeaderValue::from_static("example.com"));
        inbound.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        inbound.insert("cf-ray", HeaderValue::from_static("abc"));
        inbound.insert("x-codex-lb-force-account-id", HeaderValue::from_static("acc-1"));
        inbound.insert("content-type", HeaderValue::from_static("application/json"));

        let upstream = build_upstream_headers(&inbound, "fresh-token", "acc-2");
        assert_eq!(upstream.get("authorization").unwrap(), "Bearer fresh-token");
        assert_eq!(upstream.get("chatgpt-account-id").unwrap(), "acc-2");
        assert!(!upstream.contains_key("host"));
        assert!(!upstream.contains_key("x-forwarded-for"));
        assert!(!upstream.contains_key("cf-ray"));
        assert!(!upstream.contains_key("x-codex-lb-force-account-id"));
        assert_eq!(upstream.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn take_forced_account_id_reads_debug_header() {
        let mut inbound = HeaderMap::new();
        inbound.insert("x-codex-lb-force-account-id", HeaderValue::from_static("acc-9"));
        assert_eq!(take_forced_account_id(&inbound), Some("acc-9".to_string()));
    }
}
