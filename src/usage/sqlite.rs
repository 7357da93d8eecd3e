use super::{LatestUsage, UsageSample, UsageStore, Window};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS usage_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL,
    window TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    used_percent REAL NOT NULL,
    reset_at TEXT,
    window_minutes INTEGER NOT NULL,
    capacity_credits REAL
);

CREATE INDEX IF NOT EXISTS idx_usage_account_window_recorded
    ON usage_history(window, account_id, recorded_at DESC);
"#;

pub struct SqliteUsageStore {
    conn: Arc<Mutex<Connection>>,
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).ok().map(|d| d.with_timezone(&Utc))
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageSample> {
    let account_id: String = row.get(0)?;
    let window: String = row.get(1)?;
    let recorded_at: String = row.get(2)?;
    let used_percent: f64 = row.get(3)?;
    let reset_at: Option<String> = row.get(4)?;
    let window_minutes: i64 = row.get(5)?;
    let capacity_credits: Option<f64> = row.get(6)?;

    Ok(UsageSample {
        account_id,
        window: Window::from_str_lenient(&window),
        recorded_at: parse_ts(&recorded_at).unwrap_or_else(Utc::now),
        used_percent,
        reset_at: reset_at.and_then(|s| parse_ts(&s)),
        window_minutes,
        capacity_credits,
    }
    .normalized())
}

impl SqliteUsageStore {
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
impl UsageStore for SqliteUsageStore {
    async fn append(&self, sample: UsageSample) -> anyhow::Result<()> {
        let sample = sample.normalized();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO usage_history (account_id, window, recorded_at, used_percent, reset_at, \
             window_minutes, capacity_credits) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.account_id,
                sample.window.as_str(),
                fmt_ts(&sample.recorded_at),
                sample.used_percent,
                sample.reset_at.map(|t| fmt_ts(&t)),
                sample.window_minutes,
                sample.capacity_credits,
            ],
        )?;
        Ok(())
    }

    async fn latest_by_account(&self, window: Window) -> anyhow::Result<HashMap<String, UsageSample>> {
        let conn = self.conn.lock().await;
        // Single indexed pass: the (window, account_id, recorded_at desc)
        // index makes this a group-wise max without a correlated subquery
        // per account (spec §4.B).
        let mut stmt = conn.prepare(
            "SELECT account_id, window, recorded_at, used_percent, reset_at, window_minutes, capacity_credits \
             FROM usage_history u \
             WHERE window = ?1 AND recorded_at = ( \
                 SELECT MAX(recorded_at) FROM usage_history \
                 WHERE account_id = u.account_id AND window = ?1 \
             )",
        )?;
        let rows = stmt.query_map(params![window.as_str()], row_to_sample)?;
        let mut out = HashMap::new();
        for row in rows {
            let sample = row?;
            out.insert(sample.account_id.clone(), sample);
        }
        Ok(out)
    }

    async fn latest_primary_secondary_by_account(
        &self,
    ) -> anyhow::Result<HashMap<String, LatestUsage>> {
        let primary = self.latest_by_account(Window::Primary).await?;
        let secondary = self.latest_by_account(Window::Secondary).await?;
        let mut out: HashMap<String, LatestUsage> = HashMap::new();
        for (id, sample) in primary {
            out.entry(id).or_default().primary = Some(sample);
        }
        for (id, sample) in secondary {
            out.entry(id).or_default().secondary = Some(sample);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(account_id: &str, window: Window, recorded_at: DateTime<Utc>, used_percent: f64) -> UsageSample {
        UsageSample {
            account_id: account_id.to_string(),
            window,
            recorded_at,
            used_percent,
            reset_at: Some(recorded_at + Duration::days(7)),
            window_minutes: if window == Window::Primary { 300 } else { 10080 },
            capacity_credits: None,
        }
    }

    #[tokio::test]
    async fn latest_by_account_picks_most_recent() {
        let store = SqliteUsageStore::open_in_memory().unwrap();
        let t0 = Utc::now() - Duration::hours(2);
        let t1 = Utc::now();
        store.append(sample("a", Window::Secondary, t0, 10.0)).await.unwrap();
        store.append(sample("a", Window::Secondary, t1, 40.0)).await.unwrap();
        let latest = store.latest_by_account(Window::Secondary).await.unwrap();
        assert_eq!(latest["a"].used_percent, 40.0);
    }

    #[tokio::test]
    async fn misnamed_primary_window_is_reclassified_as_secondary() {
        let store = SqliteUsageStore::open_in_memory().unwrap();
        let mut long_primary = sample("a", Window::Primary, Utc::now(), 5.0);
        long_primary.window_minutes = 10080; // 7 days, mislabeled as primary
        store.append(long_primary).await.unwrap();

        let primary = store.latest_by_account(Window::Primary).await.unwrap();
        assert!(primary.is_empty());
        let secondary = store.latest_by_account(Window::Secondary).await.unwrap();
        assert_eq!(secondary["a"].used_percent, 5.0);
    }

    #[tokio::test]
    async fn latest_primary_secondary_merges_independently() {
        let store = SqliteUsageStore::open_in_memory().unwrap();
        store.append(sample("a", Window::Primary, Utc::now(), 20.0)).await.unwrap();
        let merged = store.latest_primary_secondary_by_account().await.unwrap();
        assert!(merged["a"].primary.is_some());
        assert!(merged["a"].secondary.is_none());
    }
}
