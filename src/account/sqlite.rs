use super::{Account, AccountStatus, AccountStore, DeactivationReason, NewAccount, PlanType, TokenUpdate};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Accounts are the one store spec §6 calls out as needing to roam across
/// file-sync (iCloud/Dropbox-style) setups, so it keeps SQLite's default
/// rollback journal rather than WAL (WAL's `-wal`/`-shm` sidecars don't
/// survive naive file sync).
const SCHEMA: &str = r#"
PRAGMA journal_mode = DELETE;

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY NOT NULL,
    email TEXT,
    plan_type TEXT NOT NULL DEFAULT 'unknown',
    access_token_encrypted TEXT NOT NULL,
    refresh_token_encrypted TEXT NOT NULL,
    id_token_encrypted TEXT,
    access_token_expires_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    deactivation_reason TEXT,
    reset_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_email ON accounts(email) WHERE email IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(status);
"#;

pub struct SqliteAccountStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let id: String = row.get(0)?;
    let email: Option<String> = row.get(1)?;
    let plan_type: String = row.get(2)?;
    let access_token_encrypted: String = row.get(3)?;
    let refresh_token_encrypted: String = row.get(4)?;
    let id_token_encrypted: Option<String> = row.get(5)?;
    let access_token_expires_at: String = row.get(6)?;
    let status: String = row.get(7)?;
    let deactivation_reason: Option<String> = row.get(8)?;
    let reset_at: Option<String> = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(Account {
        id,
        email,
        plan_type: PlanType::from_str_lenient(&plan_type),
        access_token_encrypted,
        refresh_token_encrypted,
        id_token_encrypted,
        access_token_expires_at: parse_ts(&access_token_expires_at)
            .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
        status: AccountStatus::from_str_lenient(&status),
        deactivation_reason: deactivation_reason.as_deref().map(DeactivationReason::from_str_lenient),
        reset_at: reset_at.and_then(|s| parse_ts(&s).ok()),
        created_at: parse_ts(&created_at).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
        updated_at: parse_ts(&updated_at).unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
    })
}

const SELECT_COLUMNS: &str = "id, email, plan_type, access_token_encrypted, refresh_token_encrypted, \
    id_token_encrypted, access_token_expires_at, status, deactivation_reason, reset_at, created_at, updated_at";

impl SqliteAccountStore {
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
impl AccountStore for SqliteAccountStore {
    async fn create(&self, new: NewAccount) -> anyhow::Result<Account> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        // Email uniqueness is last-write-wins: an existing row with the same
        // email has its token material upserted rather than erroring, per
        // spec §4.A.
        if let Some(email) = &new.email {
            let existing_id: Option<String> = conn
                .query_row(
                    "SELECT id FROM accounts WHERE email = ?1",
                    params![email],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(existing_id) = existing_id {
                conn.execute(
                    "UPDATE accounts SET plan_type = ?1, access_token_encrypted = ?2, \
                     refresh_token_encrypted = ?3, id_token_encrypted = ?4, \
                     access_token_expires_at = ?5, updated_at = ?6 WHERE id = ?7",
                    params![
                        new.plan_type.as_str(),
                        new.access_token_encrypted,
                        new.refresh_token_encrypted,
                        new.id_token_encrypted,
                        fmt_ts(&new.access_token_expires_at),
                        fmt_ts(&now),
                        existing_id,
                    ],
                )?;
                return conn
                    .query_row(
                        &format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE id = ?1"),
                        params![existing_id],
                        row_to_account,
                    )
                    .map_err(Into::into);
            }
        }

        conn.execute(
            "INSERT INTO accounts (id, email, plan_type, access_token_encrypted, \
             refresh_token_encrypted, id_token_encrypted, access_token_expires_at, \
             status, reset_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', NULL, ?8, ?8)",
            params![
                new.id,
                new.email,
                new.plan_type.as_str(),
                new.access_token_encrypted,
                new.refresh_token_encrypted,
                new.id_token_encrypted,
                fmt_ts(&new.access_token_expires_at),
                fmt_ts(&now),
            ],
        )?;

        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE id = ?1"),
            params![new.id],
            row_to_account,
        )
        .map_err(Into::into)
    }

    async fn get_by_id(&self, id: &str) -> anyhow::Result<Option<Account>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE id = ?1"),
            params![id],
            row_to_account,
        )
        .optional()
        .map_err(Into::into)
    }

    async fn get_by_email(&self, email: &str) -> anyhow::Result<Option<Account>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE email = ?1"),
            params![email],
            row_to_account,
        )
        .optional()
        .map_err(Into::into)
    }

    async fn list(&self) -> anyhow::Result<Vec<Account>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM accounts ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_account)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn update_tokens(&self, id: &str, update: TokenUpdate) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET access_token_encrypted = ?1, refresh_token_encrypted = ?2, \
             id_token_encrypted = ?3, access_token_expires_at = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                update.access_token_encrypted,
                update.refresh_token_encrypted,
                update.id_token_encrypted,
                fmt_ts(&update.access_token_expires_at),
                fmt_ts(&Utc::now()),
                id,
            ],
        )?;
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: AccountStatus,
        reset_at: Option<DateTime<Utc>>,
        deactivation_reason: Option<DeactivationReason>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE accounts SET status = ?1, reset_at = ?2, deactivation_reason = ?3, updated_at = ?4 \
             WHERE id = ?5",
            params![
                status.as_str(),
                reset_at.map(|t| fmt_ts(&t)),
                deactivation_reason.map(|r| r.as_str()),
                fmt_ts(&Utc::now()),
                id,
            ],
        )?;
        Ok(())
    }

    async fn bulk_clear_to_active(&self, ids: &[String]) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE accounts SET status = 'active', reset_at = NULL, updated_at = ?1 WHERE id = ?2",
            )?;
            let now = fmt_ts(&Utc::now());
            for id in ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().await;
        let affected = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(id: &str, email: &str) -> NewAccount {
        NewAccount {
            id: id.to_string(),
            email: Some(email.to_string()),
            plan_type: PlanType::Pro,
            access_token_encrypted: "enc-access".to_string(),
            refresh_token_encrypted: "enc-refresh".to_string(),
            id_token_encrypted: None,
            access_token_expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trips() {
        let store = SqliteAccountStore::open_in_memory().unwrap();
        let created = store.create(sample("acc-1", "a@example.com")).await.unwrap();
        let fetched = store.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(created.id, fetched.id);
        assert_eq!(fetched.status, AccountStatus::Active);
        assert_eq!(fetched.plan_type, PlanType::Pro);
    }

    #[tokio::test]
    async fn duplicate_email_is_upsert_not_error() {
        let store = SqliteAccountStore::open_in_memory().unwrap();
        store.create(sample("acc-1", "a@example.com")).await.unwrap();
        let second = sample("acc-2", "a@example.com");
        let result = store.create(second).await.unwrap();
        // Upsert keeps the original id, only refreshes token material.
        assert_eq!(result.id, "acc-1");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bulk_clear_to_active_resets_blocked_accounts() {
        let store = SqliteAccountStore::open_in_memory().unwrap();
        store.create(sample("acc-1", "a@example.com")).await.unwrap();
        store
            .update_status(
                "acc-1",
                AccountStatus::RateLimited,
                Some(Utc::now() - Duration::seconds(10)),
                None,
            )
            .await
            .unwrap();
        store.bulk_clear_to_active(&["acc-1".to_string()]).await.unwrap();
        let fetched = store.get_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, AccountStatus::Active);
        assert!(fetched.reset_at.is_none());
    }

    #[tokio::test]
    async fn delete_cascades_are_handled_by_caller() {
        let store = SqliteAccountStore::open_in_memory().unwrap();
        store.create(sample("acc-1", "a@example.com")).await.unwrap();
        assert!(store.delete("acc-1").await.unwrap());
        assert!(store.get_by_id("acc-1").await.unwrap().is_none());
        assert!(!store.delete("acc-1").await.unwrap());
    }
}
