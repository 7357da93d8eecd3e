//! Dashboard Settings — single-row operator-facing configuration.
//!
//! Persisted in the operational database as a single row keyed `id = 1`, so
//! pinned accounts and retention knobs survive a restart (spec §3, §4.F).

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dashboard_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    pinned_account_ids TEXT NOT NULL DEFAULT '[]',
    request_log_retention_days INTEGER NOT NULL DEFAULT 30,
    debug_endpoints_enabled INTEGER NOT NULL DEFAULT 0
);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardSettings {
    pub pinned_account_ids: Vec<String>,
    pub request_log_retention_days: u32,
    pub debug_endpoints_enabled: bool,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            pinned_account_ids: Vec::new(),
            request_log_retention_days: 30,
            debug_endpoints_enabled: false,
        }
    }
}

pub struct DashboardSettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl DashboardSettingsStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Self::seed_default_row(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Self::seed_default_row(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn seed_default_row(conn: &Connection) -> anyhow::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO dashboard_settings (id, pinned_account_ids, \
             request_log_retention_days, debug_endpoints_enabled) VALUES (1, '[]', 30, 0)",
            [],
        )?;
        Ok(())
    }

    pub async fn get(&self) -> anyhow::Result<DashboardSettings> {
        let conn = self.conn.lock().await;
        let row: Option<(String, u32, i64)> = conn
            .query_row(
                "SELECT pinned_account_ids, request_log_retention_days, debug_endpoints_enabled \
                 FROM dashboard_settings WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((pinned_json, retention_days, debug_enabled)) = row else {
            return Ok(DashboardSettings::default());
        };
        Ok(DashboardSettings {
            pinned_account_ids: serde_json::from_str(&pinned_json).unwrap_or_default(),
            request_log_retention_days: retention_days,
            debug_endpoints_enabled: debug_enabled != 0,
        })
    }

    pub async fn pinned_account_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.get().await?.pinned_account_ids)
    }

    pub async fn set_pinned_account_ids(&self, ids: Vec<String>) -> anyhow::Result<()> {
        let json = serde_json::to_string(&ids)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE dashboard_settings SET pinned_account_ids = ?1 WHERE id = 1",
            params![json],
        )?;
        Ok(())
    }

    /// Prunes one id from the pinned set; a no-op if it wasn't pinned.
    /// Used by the Mark Engine when an account is marked `quota_exceeded`.
    pub async fn remove_pinned_account(&self, account_id: &str) -> anyhow::Result<()> {
        let mut ids = self.pinned_account_ids().await?;
        ids.retain(|id| id != account_id);
        self.set_pinned_account_ids(ids).await
    }

    pub async fn set_request_log_retention_days(&self, days: u32) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE dashboard_settings SET request_log_retention_days = ?1 WHERE id = 1",
            params![days],
        )?;
        Ok(())
    }

    pub async fn set_debug_endpoints_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE dashboard_settings SET debug_endpoints_enabled = ?1 WHERE id = 1",
            params![enabled as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_on_fresh_store() {
        let store = DashboardSettingsStore::open_in_memory().unwrap();
        let settings = store.get().await.unwrap();
        assert!(settings.pinned_account_ids.is_empty());
        assert_eq!(settings.request_log_retention_days, 30);
    }

    #[tokio::test]
    async fn pinned_accounts_round_trip() {
        let store = DashboardSettingsStore::open_in_memory().unwrap();
        store
            .set_pinned_account_ids(vec!["acc-1".to_string(), "acc-2".to_string()])
            .await
            .unwrap();
        assert_eq!(store.pinned_account_ids().await.unwrap(), vec!["acc-1", "acc-2"]);
    }

    #[tokio::test]
    async fn remove_pinned_account_prunes_only_that_id() {
        let store = DashboardSettingsStore::open_in_memory().unwrap();
        store
            .set_pinned_account_ids(vec!["acc-1".to_string(), "acc-2".to_string()])
            .await
            .unwrap();
        store.remove_pinned_account("acc-1").await.unwrap();
        assert_eq!(store.pinned_account_ids().await.unwrap(), vec!["acc-2"]);
    }
}
