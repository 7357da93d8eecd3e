//! Sticky Session Store — `fingerprint -> account_id` with TTL.

pub mod db;
pub mod memory;

pub use db::DbStickyStore;
pub use memory::MemoryStickyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

#[derive(Debug, Clone)]
pub struct StickyEntry {
    pub fingerprint: String,
    pub account_id: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait StickyStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<StickyEntry>>;
    async fn put_with_ttl(
        &self,
        fingerprint: &str,
        account_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<()>;
    async fn delete(&self, fingerprint: &str) -> anyhow::Result<()>;
}

/// HMAC-SHA-256 of the client-supplied `prompt_cache_key`, hex-encoded.
/// Never the raw key (spec §4.D).
pub fn fingerprint_of(prompt_cache_key: &str, hmac_key: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(prompt_cache_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_hides_raw_key() {
        let key = b"server-secret";
        let a = fingerprint_of("conversation-123", key);
        let b = fingerprint_of("conversation-123", key);
        assert_eq!(a, b);
        assert_ne!(a, "conversation-123");
    }

    #[test]
    fn fingerprint_differs_for_different_keys() {
        let key = b"server-secret";
        assert_ne!(fingerprint_of("a", key), fingerprint_of("b", key));
    }
}
