//! Durable sticky store backed by the operational database (spec §4.D).
//!
//! Used when `STICKY_BACKEND=db` so sticky affinity survives a restart.

use super::{StickyEntry, StickyStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sticky_sessions (
    fingerprint TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sticky_expires_at ON sticky_sessions(expires_at);
"#;

pub struct DbStickyStore {
    conn: Arc<Mutex<Connection>>,
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|d| d.with_timezone(&Utc))
}

impl DbStickyStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }
}

#[async_trait]
impl StickyStore for DbStickyStore {
    async fn get(&self, fingerprint: &str) -> anyhow::Result<Option<StickyEntry>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT account_id, expires_at FROM sticky_sessions WHERE fingerprint = ?1",
                params![fingerprint],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();
        let Some((account_id, expires_at)) = row else { return Ok(None) };
        let Some(expires_at) = parse_ts(&expires_at) else { return Ok(None) };
        if expires_at <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(StickyEntry { fingerprint: fingerprint.to_string(), account_id, expires_at }))
    }

    async fn put_with_ttl(
        &self,
        fingerprint: &str,
        account_id: &str,
        ttl: std::time::Duration,
    ) -> anyhow::Result<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sticky_sessions (fingerprint, account_id, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(fingerprint) DO UPDATE SET account_id = excluded.account_id, \
             expires_at = excluded.expires_at",
            params![fingerprint, account_id, fmt_ts(&expires_at)],
        )?;
        Ok(())
    }

    async fn delete(&self, fingerprint: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sticky_sessions WHERE fingerprint = ?1", params![fingerprint])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = DbStickyStore::open_in_memory().unwrap();
        store.put_with_ttl("fp1", "acc-1", Duration::from_secs(60)).await.unwrap();
        let entry = store.get("fp1").await.unwrap().unwrap();
        assert_eq!(entry.account_id, "acc-1");
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let store = DbStickyStore::open_in_memory().unwrap();
        store.put_with_ttl("fp1", "acc-1", Duration::from_millis(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get("fp1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_overwrites_existing_entry() {
        let store = DbStickyStore::open_in_memory().unwrap();
        store.put_with_ttl("fp1", "acc-1", Duration::from_secs(60)).await.unwrap();
        store.put_with_ttl("fp1", "acc-2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("fp1").await.unwrap().unwrap().account_id, "acc-2");
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = DbStickyStore::open_in_memory().unwrap();
        store.put_with_ttl("fp1", "acc-1", Duration::from_secs(60)).await.unwrap();
        store.delete("fp1").await.unwrap();
        assert!(store.get("fp1").await.unwrap().is_none());
    }
}
