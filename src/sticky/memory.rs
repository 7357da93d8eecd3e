//! Process-local sticky store — the default backend (spec §4.D).

use super::{StickyEntry, StickyStore};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryStickyStore {
    entries: Arc<RwLock<HashMap<String, StickyEntry>>>,
}

impl MemoryStickyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StickyStore for MemoryStickyStore {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<StickyEntry>> {
        let entries = self.entries.read().await;
        match entries.get(fingerprint) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(Some(entry.clone())),
            Some(_) => Ok(None), // expired; left for lazy sweep below
            None => Ok(None),
        }
    }

    async fn put_with_ttl(
        &self,
        fingerprint: &str,
        account_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            fingerprint.to_string(),
            StickyEntry {
                fingerprint: fingerprint.to_string(),
                account_id: account_id.to_string(),
                expires_at: Utc::now() + chrono::Duration::from_std(ttl)?,
            },
        );
        // Opportunistic sweep of expired entries, bounded to avoid turning a
        // hot-path write into an O(n) scan every time: only sweep when the
        // map has grown noticeably past its live size.
        if entries.len() % 256 == 0 {
            let now = Utc::now();
            entries.retain(|_, e| e.expires_at > now);
        }
        Ok(())
    }

    async fn delete(&self, fingerprint: &str) -> anyhow::Result<()> {
        self.entries.write().await.remove(fingerprint);
        Ok(())
    }
}
