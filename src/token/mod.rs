//! Token Manager — decrypts tokens on demand and refreshes them via OAuth
//! with a per-account coalescing guard (spec §4.E).

use crate::account::{Account, AccountStore, DeactivationReason, TokenUpdate};
use crate::crypto::TokenCipher;
use crate::error::ProxyError;
use crate::mark::MarkEngine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
/// Access tokens are refreshed this far ahead of actual expiry so a request
/// never races the upstream clock.
const SAFETY_MARGIN: Duration = Duration::seconds(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug)]
pub struct FreshToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenManager {
    accounts: Arc<dyn AccountStore>,
    cipher: Arc<TokenCipher>,
    mark: Arc<MarkEngine>,
    http: reqwest::Client,
    /// At most one refresh in flight per account; other callers wait on the
    /// same lock rather than firing a second upstream refresh request.
    refresh_guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(accounts: Arc<dyn AccountStore>, cipher: Arc<TokenCipher>, mark: Arc<MarkEngine>, http: reqwest::Client) -> Self {
        Self { accounts, cipher, mark, http, refresh_guards: Mutex::new(HashMap::new()) }
    }

    async fn guard_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.refresh_guards.lock().await;
        guards.entry(account_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Returns a usable access token, refreshing it first if it is expired
    /// or within `SAFETY_MARGIN` of expiry.
    pub async fn get_fresh_access_token(&self, account_id: &str) -> Result<FreshToken, ProxyError> {
        let account = self
            .accounts
            .get_by_id(account_id)
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()))?
            .ok_or_else(|| ProxyError::Internal(format!("account {account_id} not found")))?;

        if account.access_token_expires_at > Utc::now() + SAFETY_MARGIN {
            let access_token = self
                .cipher
                .decrypt(&account.access_token_encrypted)
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            return Ok(FreshToken { access_token, expires_at: account.access_token_expires_at });
        }

        let guard = self.guard_for(account_id).await;
        let _permit = guard.lock().await;

        // Re-read: another task may have refreshed while we waited for the guard.
        let account = self
            .accounts
            .get_by_id(account_id)
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()))?
            .ok_or_else(|| ProxyError::Internal(format!("account {account_id} not found")))?;
        if account.access_token_expires_at > Utc::now() + SAFETY_MARGIN {
            let access_token = self
                .cipher
                .decrypt(&account.access_token_encrypted)
                .map_err(|e| ProxyError::Internal(e.to_string()))?;
            return Ok(FreshToken { access_token, expires_at: account.access_token_expires_at });
        }

        self.refresh(&account).await
    }

    async fn refresh(&self, account: &Account) -> Result<FreshToken, ProxyError> {
        let refresh_token = self
            .cipher
            .decrypt(&account.refresh_token_encrypted)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;

        let response = self
            .http
            .post(OPENAI_TOKEN_URL)
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": OPENAI_CLIENT_ID,
            }))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.mark.mark_transient_error(&account.id).await;
                return Err(ProxyError::UpstreamUnavailable(e.to_string()));
            }
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::BAD_REQUEST
        {
            // Rotated refresh tokens used twice, or a revoked grant, surface
            // as a permanent deactivation rather than a transient error —
            // retrying will never succeed (spec §4.E).
            self.mark.mark_permanent_failure(&account.id, DeactivationReason::AuthRefreshFailed).await;
            return Err(ProxyError::AuthRefreshFailed(format!(
                "refresh rejected with status {}",
                response.status()
            )));
        }

        if !response.status().is_success() {
            self.mark.mark_transient_error(&account.id).await;
            return Err(ProxyError::UpstreamUnavailable(format!(
                "token refresh failed with status {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::AuthRefreshFailed(format!("malformed token response: {e}")))?;

        let expires_at = Utc::now() + Duration::seconds(body.expires_in.unwrap_or(3600));
        let access_token_encrypted =
            self.cipher.encrypt(&body.access_token).map_err(|e| ProxyError::Internal(e.to_string()))?;
        // Upstream may omit a rotated refresh token; if so, keep the one we
        // already have rather than re-encrypting the decrypted copy.
        let refresh_token_encrypted = match &body.refresh_token {
            Some(rotated) => self.cipher.encrypt(rotated).map_err(|e| ProxyError::Internal(e.to_string()))?,
            None => account.refresh_token_encrypted.clone(),
        };
        let id_token_encrypted = match &body.id_token {
            Some(id_token) => {
                Some(self.cipher.encrypt(id_token).map_err(|e| ProxyError::Internal(e.to_string()))?)
            }
            None => account.id_token_encrypted.clone(),
        };

        // Rotated tokens must be durably persisted before use, or a retry
        // after a crash would replay an already-consumed refresh token.
        self.accounts
            .update_tokens(
                &account.id,
                TokenUpdate {
                    access_token_encrypted,
                    refresh_token_encrypted,
                    id_token_encrypted,
                    access_token_expires_at: expires_at,
                },
            )
            .await
            .map_err(|e| ProxyError::Internal(e.to_string()))?;

        Ok(FreshToken { access_token: body.access_token, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{InMemoryAccountStore, NewAccount, PlanType};
    use crate::settings::DashboardSettingsStore;
    use crate::usage::InMemoryUsageStore;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    async fn setup(access_expires_at: DateTime<Utc>) -> (TokenManager, Arc<InMemoryAccountStore>, Arc<TokenCipher>) {
        let dir = tempdir().unwrap();
        let cipher = Arc::new(TokenCipher::load_or_create(&dir.path().join("key")).await.unwrap());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let access = cipher.encrypt("old-access").unwrap();
        let refresh = cipher.encrypt("old-refresh").unwrap();
        accounts
            .create(NewAccount {
                id: "acc-1".to_string(),
                email: None,
                plan_type: PlanType::Plus,
                access_token_encrypted: access,
                refresh_token_encrypted: refresh,
                id_token_encrypted: None,
                access_token_expires_at: access_expires_at,
            })
            .await
            .unwrap();

        let settings = Arc::new(DashboardSettingsStore::open(&dir.path().join("settings.db")).unwrap());
        let usage = Arc::new(InMemoryUsageStore::new());
        let config = crate::config::Config::for_tests(PathBuf::from(dir.path()));
        let mark = Arc::new(MarkEngine::new(accounts.clone(), settings, usage, Arc::new(AtomicU64::new(0)), &config));
        let manager = TokenManager::new(accounts.clone(), cipher.clone(), mark, reqwest::Client::new());
        (manager, accounts, cipher)
    }

    #[tokio::test]
    async fn returns_cached_token_when_not_near_expiry() {
        let (manager, _accounts, _cipher) = setup(Utc::now() + Duration::hours(1)).await;
        let token = manager.get_fresh_access_token("acc-1").await.unwrap();
        assert_eq!(token.access_token, "old-access");
    }

    #[tokio::test]
    async fn unknown_account_is_an_internal_error() {
        let (manager, _accounts, _cipher) = setup(Utc::now() + Duration::hours(1)).await;
        let err = manager.get_fresh_access_token("does-not-exist").await.unwrap_err();
        assert!(matches!(err, ProxyError::Internal(_)));
    }
}
