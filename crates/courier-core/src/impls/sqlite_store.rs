//! SqliteMessageStore - SQLite 実装（sqlx）
//!
//! # 方針
//! - 時刻は INTEGER（unix ミリ秒）で保存し、claim 条件は数値比較
//! - claim と書き戻しは単一の条件付き `UPDATE`
//! - `rows_affected() == 1` だけを claim 成功の合図とする

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::domain::{
    MessageId, MessageStatus, NewMessage, OutboxError, OutboxMessage, Resolution, StatusCounts,
    TaskType, WorkerId,
};
use crate::ports::MessageStore;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_message (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type       TEXT    NOT NULL,
    dedup_key       TEXT,
    payload         TEXT    NOT NULL,
    status          INTEGER NOT NULL DEFAULT 0,
    attempt         INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL,
    next_attempt_at INTEGER NOT NULL,
    locked_until    INTEGER,
    locked_by       TEXT,
    last_error      TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
)
"#;

const CREATE_DUE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_outbox_message_due \
     ON outbox_message (status, next_attempt_at, id)";

const COLUMNS: &str = "id, task_type, dedup_key, payload, status, attempt, max_attempts, \
     next_attempt_at, locked_until, locked_by, last_error, created_at, updated_at";

/// Eligibility predicate. Binds: `now`, `now`.
const CLAIMABLE: &str = "status IN (0, 1) \
     AND next_attempt_at <= ? \
     AND (locked_until IS NULL OR locked_until < ?)";

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    task_type: String,
    dedup_key: Option<String>,
    payload: String,
    status: i64,
    attempt: i64,
    max_attempts: i64,
    next_attempt_at: i64,
    locked_until: Option<i64>,
    locked_by: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<MessageRow> for OutboxMessage {
    type Error = OutboxError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| OutboxError::CorruptRow { id, reason };
        let ts = |column: &str, ms: i64| {
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("{column} out of range: {ms}")))
        };
        let count = |column: &str, n: i64| {
            u32::try_from(n).map_err(|_| corrupt(format!("{column} out of range: {n}")))
        };

        Ok(OutboxMessage {
            id: MessageId::new(row.id),
            task_type: TaskType::new(row.task_type),
            dedup_key: row.dedup_key,
            payload: row.payload,
            status: MessageStatus::from_code(row.status)
                .ok_or_else(|| corrupt(format!("unknown status code {}", row.status)))?,
            attempt: count("attempt", row.attempt)?,
            max_attempts: count("max_attempts", row.max_attempts)?,
            next_attempt_at: ts("next_attempt_at", row.next_attempt_at)?,
            locked_until: row
                .locked_until
                .map(|ms| ts("locked_until", ms))
                .transpose()?,
            locked_by: row.locked_by,
            last_error: row.last_error,
            created_at: ts("created_at", row.created_at)?,
            updated_at: ts("updated_at", row.updated_at)?,
        })
    }
}

fn rows_to_messages(rows: Vec<MessageRow>) -> Result<Vec<OutboxMessage>, OutboxError> {
    rows.into_iter().map(OutboxMessage::try_from).collect()
}

fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn limit_to_i64(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `MessageStore` backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (creating if missing) the database at `url` and make sure the
    /// schema exists.
    ///
    /// # Example
    /// ```ignore
    /// let store = SqliteMessageStore::connect("sqlite://courier.db").await?;
    /// ```
    pub async fn connect(url: &str) -> Result<Self, OutboxError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every connection to `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, OutboxError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool. Creates the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, OutboxError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_DUE_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(&self, message: NewMessage) -> Result<MessageId, OutboxError> {
        let created_at = ms(message.created_at);
        let result = sqlx::query(
            "INSERT INTO outbox_message \
             (task_type, dedup_key, payload, status, attempt, max_attempts, \
              next_attempt_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(message.task_type.as_str())
        .bind(message.dedup_key.as_deref())
        .bind(&message.payload)
        .bind(MessageStatus::Pending.code())
        .bind(i64::from(message.max_attempts))
        .bind(ms(message.next_attempt_at))
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(MessageId::new(result.last_insert_rowid()))
    }

    async fn select_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let now = ms(now);
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_message WHERE {CLAIMABLE} ORDER BY id ASC LIMIT ?"
        ))
        .bind(now)
        .bind(now)
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows_to_messages(rows)
    }

    async fn try_claim(
        &self,
        id: MessageId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let now = ms(now);
        let result = sqlx::query(&format!(
            "UPDATE outbox_message \
             SET status = ?, locked_by = ?, locked_until = ?, updated_at = ? \
             WHERE id = ? AND {CLAIMABLE}"
        ))
        .bind(MessageStatus::Processing.code())
        .bind(worker_id.as_str())
        .bind(ms(lease_until))
        .bind(now)
        .bind(id.get())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if !claimed {
            debug!(message_id = id.get(), worker_id = %worker_id, "claim lost to another worker");
        }
        Ok(claimed)
    }

    async fn fetch_many(&self, ids: &[MessageId]) -> Result<Vec<OutboxMessage>, OutboxError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM outbox_message WHERE id IN ("));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(id.get());
        }
        separated.push_unseparated(") ORDER BY id ASC");

        let rows = query
            .build_query_as::<MessageRow>()
            .fetch_all(&self.pool)
            .await?;
        rows_to_messages(rows)
    }

    async fn resolve(
        &self,
        id: MessageId,
        worker_id: &WorkerId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let status = resolution.status();
        // NULL keeps the current column value.
        let (attempt, next_attempt_at, last_error) = match resolution {
            Resolution::Succeeded => (None, None, None),
            Resolution::Dead { attempt, error } => (Some(i64::from(attempt)), None, Some(error)),
            Resolution::Retry {
                attempt,
                next_attempt_at,
                error,
            } => (
                Some(i64::from(attempt)),
                Some(ms(next_attempt_at)),
                Some(error),
            ),
        };

        let result = sqlx::query(
            "UPDATE outbox_message \
             SET status = ?, \
                 attempt = COALESCE(?, attempt), \
                 next_attempt_at = COALESCE(?, next_attempt_at), \
                 last_error = COALESCE(?, last_error), \
                 locked_by = NULL, \
                 locked_until = NULL, \
                 updated_at = ? \
             WHERE id = ? AND locked_by = ?",
        )
        .bind(status.code())
        .bind(attempt)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(ms(now))
        .bind(id.get())
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxError> {
        let row: Option<MessageRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM outbox_message WHERE id = ?"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;

        row.map(OutboxMessage::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        status: MessageStatus,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, OutboxError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM outbox_message WHERE status = ? ORDER BY id ASC LIMIT ?"
        ))
        .bind(status.code())
        .bind(limit_to_i64(limit))
        .fetch_all(&self.pool)
        .await?;

        rows_to_messages(rows)
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, OutboxError> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outbox_message GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (code, n) in rows {
            let status =
                MessageStatus::from_code(code).ok_or(OutboxError::UnknownStatusCode(code))?;
            counts.add(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}
