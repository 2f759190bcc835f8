use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::models::{AttachOutcome, CallRecord};
use crate::error::DatabaseError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS call_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    call_id TEXT NOT NULL UNIQUE,
    start_time DATETIME,
    end_time DATETIME,
    audio_url TEXT
)
"#;

#[derive(Debug, Clone)]
pub struct DbOperations {
    pool: SqlitePool,
}

impl DbOperations {
    /// Open (creating if needed) the database at `url` and make sure the schema exists.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout);

        // Every connection to `:memory:` opens its own empty database.
        if url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let db = Self { pool };
        db.initialize().await?;

        info!(url, "Call-record store ready");
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self, DatabaseError> {
        Self::connect("sqlite::memory:", 1, Duration::from_secs(5)).await
    }

    async fn initialize(&self) -> Result<(), DatabaseError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Claim the recording slot of `call_id` for `audio_url`, first come first served.
    ///
    /// A call without a row gets one, stamped with the current time. A row
    /// whose `audio_url` is empty is filled in. A row that already has a
    /// recording is left alone.
    pub async fn attach_recording(
        &self,
        call_id: &str,
        audio_url: &str,
    ) -> Result<AttachOutcome, DatabaseError> {
        let claimed = sqlx::query(
            r#"
            INSERT INTO call_history (call_id, start_time, audio_url)
            VALUES (?, ?, ?)
            ON CONFLICT(call_id) DO UPDATE SET audio_url = excluded.audio_url
            WHERE call_history.audio_url IS NULL OR call_history.audio_url = ''
            "#,
        )
        .bind(call_id)
        .bind(Utc::now())
        .bind(audio_url)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if claimed > 0 {
            debug!(call_id, audio_url, "Recording attached");
            return Ok(AttachOutcome::Attached);
        }

        let existing = self
            .find_call(call_id)
            .await?
            .and_then(|record| record.audio_url)
            .unwrap_or_default();
        Ok(AttachOutcome::AlreadyRecorded(existing))
    }

    pub async fn find_call(&self, call_id: &str) -> Result<Option<CallRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, CallRecord>(
            "SELECT id, call_id, start_time, end_time, audio_url FROM call_history WHERE call_id = ?",
        )
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Every call, most recent first.
    pub async fn list_calls(&self) -> Result<Vec<CallRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, CallRecord>(
            "SELECT id, call_id, start_time, end_time, audio_url FROM call_history ORDER BY start_time DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
