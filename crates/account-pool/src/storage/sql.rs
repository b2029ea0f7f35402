//! SQLite backend
//!
//! Timestamps are stored as INTEGER unix milliseconds. Row-level atomicity
//! comes from single-statement UPDATEs with the expected state in the WHERE
//! clause; `cas_allocate` succeeds iff exactly one row was affected.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use super::{BoxFuture, Storage};
use crate::account::{Account, AccountStatus, Insert, NewAccount, PoolStats};
use crate::clock::Clock;
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    email               TEXT    NOT NULL UNIQUE,
    password            TEXT    NOT NULL,
    first_name          TEXT,
    last_name           TEXT,
    status              TEXT    NOT NULL DEFAULT 'available'
                        CHECK (status IN ('available', 'allocated', 'invalid')),
    register_time       INTEGER NOT NULL,
    last_allocated_time INTEGER,
    metadata            TEXT,
    token               TEXT,
    created_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_accounts_status_register
    ON accounts (status, register_time);
"#;

const COLUMNS: &str = "id, email, password, first_name, last_name, status, register_time, \
                       last_allocated_time, metadata, token, created_at";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    email: String,
    password: String,
    first_name: Option<String>,
    last_name: Option<String>,
    status: String,
    register_time: i64,
    last_allocated_time: Option<i64>,
    metadata: Option<String>,
    token: Option<String>,
    created_at: i64,
}

impl TryFrom<AccountRow> for Account {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self> {
        let metadata = row
            .metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| Error::Storage(format!("account {} metadata: {e}", row.id)))?;

        Ok(Account {
            id: row.id,
            email: row.email,
            password: row.password.into(),
            first_name: row.first_name,
            last_name: row.last_name,
            status: row.status.parse()?,
            register_time: from_millis(row.register_time)?,
            last_allocated_time: row.last_allocated_time.map(from_millis).transpose()?,
            metadata,
            token: row.token.map(Into::into),
            created_at: from_millis(row.created_at)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {ms}")))
}

/// SQLite-backed account table.
pub struct SqlStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqlStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn connect(url: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(url, "connected to account database");
        Self::with_pool(pool, clock).await
    }

    /// A private in-memory database. One connection that never recycles,
    /// since each SQLite memory connection is its own database.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, clock).await
    }

    async fn with_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, clock })
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn fetch_optional(&self, sql: &str, id: Option<i64>) -> Result<Option<Account>> {
        let mut query = sqlx::query_as::<_, AccountRow>(sql);
        if let Some(id) = id {
            query = query.bind(id);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(Account::try_from)
            .transpose()
    }
}

impl Storage for SqlStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn add(&self, account: NewAccount) -> BoxFuture<'_, Result<Insert>> {
        Box::pin(async move {
            let now = self.now_millis();
            let metadata = account
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| Error::Storage(format!("serializing metadata: {e}")))?;

            let result = sqlx::query(
                "INSERT INTO accounts \
                 (email, password, first_name, last_name, status, register_time, metadata, token, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&account.email)
            .bind(account.password.expose())
            .bind(&account.first_name)
            .bind(&account.last_name)
            .bind(AccountStatus::Available.as_str())
            .bind(now)
            .bind(metadata)
            .bind(account.token.as_ref().map(|t| t.expose().as_str()))
            .bind(now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(done) => {
                    let id = done.last_insert_rowid();
                    debug!(account_id = id, "added account");
                    Ok(Insert::Added { id })
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(Insert::Duplicate),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn get_by_id(&self, id: i64) -> BoxFuture<'_, Result<Option<Account>>> {
        Box::pin(async move {
            let sql = format!("SELECT {COLUMNS} FROM accounts WHERE id = ?");
            self.fetch_optional(&sql, Some(id)).await
        })
    }

    fn oldest_available(&self) -> BoxFuture<'_, Result<Option<Account>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM accounts WHERE status = 'available' \
                 ORDER BY register_time ASC, id ASC LIMIT 1"
            );
            self.fetch_optional(&sql, None).await
        })
    }

    fn update_token<'a>(
        &'a self,
        email: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let done = sqlx::query("UPDATE accounts SET token = ? WHERE email = ?")
                .bind(token)
                .bind(email)
                .execute(&self.pool)
                .await?;
            Ok(done.rows_affected() > 0)
        })
    }

    fn set_status<'a>(
        &'a self,
        email: &'a str,
        status: AccountStatus,
        touch_allocated_time: bool,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let done = if touch_allocated_time {
                sqlx::query(
                    "UPDATE accounts SET status = ?, last_allocated_time = ? WHERE email = ?",
                )
                .bind(status.as_str())
                .bind(self.now_millis())
                .bind(email)
                .execute(&self.pool)
                .await?
            } else {
                sqlx::query("UPDATE accounts SET status = ? WHERE email = ?")
                    .bind(status.as_str())
                    .bind(email)
                    .execute(&self.pool)
                    .await?
            };
            Ok(done.rows_affected() > 0)
        })
    }

    fn cas_allocate(&self, id: i64, expected: AccountStatus) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let done = sqlx::query(
                "UPDATE accounts SET status = ?, last_allocated_time = ? \
                 WHERE id = ? AND status = ?",
            )
            .bind(AccountStatus::Allocated.as_str())
            .bind(self.now_millis())
            .bind(id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected() == 1)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<PoolStats>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, (String, i64)>(
                "SELECT status, COUNT(*) FROM accounts GROUP BY status",
            )
            .fetch_all(&self.pool)
            .await?;

            let mut stats = PoolStats::default();
            for (status, count) in rows {
                stats.record(status.parse()?, u64::try_from(count).unwrap_or(0));
            }
            Ok(stats)
        })
    }

    fn list_all(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            let sql = format!("SELECT {COLUMNS} FROM accounts ORDER BY id ASC");
            sqlx::query_as::<_, AccountRow>(&sql)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(Account::try_from)
                .collect()
        })
    }

    fn invalidate_by_suffix<'a>(&'a self, suffix: &'a str) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            if suffix.is_empty() {
                return Ok(0);
            }
            // substr with a negative start compares the tail byte-for-byte,
            // unlike LIKE which is case-insensitive and treats % and _ specially
            let done = sqlx::query(
                "UPDATE accounts SET status = ? WHERE substr(email, -length(?)) = ?",
            )
            .bind(AccountStatus::Invalid.as_str())
            .bind(suffix)
            .bind(suffix)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
    }

    fn reset_aged(&self, threshold_days: u32) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let cutoff = self.clock.now() - TimeDelta::days(i64::from(threshold_days));
            let done = sqlx::query(
                "UPDATE accounts SET status = ? WHERE status != ? AND register_time < ?",
            )
            .bind(AccountStatus::Available.as_str())
            .bind(AccountStatus::Invalid.as_str())
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
    }
}
