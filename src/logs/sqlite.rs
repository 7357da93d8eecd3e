use super::{RequestLog, RequestLogStore, RequestOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    account_id TEXT,
    requested_at TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    model TEXT,
    reasoning_effort TEXT,
    input_tokens INTEGER,
    output_tokens INTEGER,
    codex_session_id TEXT,
    codex_conversation_id TEXT,
    sticky_fingerprint TEXT
);

CREATE INDEX IF NOT EXISTS idx_request_logs_requested_at ON request_logs(requested_at);
CREATE INDEX IF NOT EXISTS idx_request_logs_account_id ON request_logs(account_id);
"#;

pub struct SqliteRequestLogStore {
    conn: Arc<Mutex<Connection>>,
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn status_str(status: RequestOutcome) -> &'static str {
    status.as_str()
}

impl SqliteRequestLogStore {
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

    pub async fn count(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row("SELECT COUNT(*) FROM request_logs", [], |row| row.get(0))?)
    }
}

#[async_trait]
impl RequestLogStore for SqliteRequestLogStore {
    async fn append_batch(&self, batch: &[RequestLog]) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO request_logs (request_id, account_id, requested_at, latency_ms, status, \
                 error_code, error_message, model, reasoning_effort, input_tokens, output_tokens, \
                 codex_session_id, codex_conversation_id, sticky_fingerprint) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for log in batch {
                stmt.execute(params![
                    log.request_id,
                    log.account_id,
                    fmt_ts(&log.requested_at),
                    log.latency_ms,
                    status_str(log.status),
                    log.error_code,
                    log.error_message,
                    log.model,
                    log.reasoning_effort,
                    log.input_tokens,
                    log.output_tokens,
                    log.codex_session_id,
                    log.codex_conversation_id,
                    log.sticky_fingerprint,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(id: &str) -> RequestLog {
        RequestLog {
            request_id: id.to_string(),
            account_id: Some("acc-1".to_string()),
            requested_at: Utc::now(),
            latency_ms: 42,
            status: RequestOutcome::Ok,
            error_code: None,
            error_message: None,
            model: Some("gpt-5-codex".to_string()),
            reasoning_effort: None,
            input_tokens: Some(10),
            output_tokens: Some(20),
            codex_session_id: None,
            codex_conversation_id: None,
            sticky_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn append_batch_persists_all_records_in_one_transaction() {
        let store = SqliteRequestLogStore::open_in_memory().unwrap();
        store.append_batch(&[log("a"), log("b"), log("c")]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn append_batch_with_empty_slice_is_a_no_op() {
        let store = SqliteRequestLogStore::open_in_memory().unwrap();
        store.append_batch(&[]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
