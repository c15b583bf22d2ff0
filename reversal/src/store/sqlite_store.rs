//! SQLite-backed implementation of the `CrashRecordStore` trait.
//!
//! One row per completed crash episode. Records are written once at
//! deactivation and never updated afterwards, but `save` still uses
//! upsert semantics so a crash-during-write retry cannot violate the
//! primary key.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::CrashRecordStore;
use crate::model::{CrashId, PriceCrashState};

pub struct SqliteCrashRecordStore {
    pool: SqlitePool,
}

impl SqliteCrashRecordStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and ensure the schema exists, so a restarted process
    /// resumes cleanly against an existing or empty database.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        let store = Self::from_pool(SqlitePool::connect(path).await?);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_crash_states (
                id TEXT PRIMARY KEY,
                highest_points REAL NOT NULL,
                final_points REAL NOT NULL,
                event_time INTEGER NOT NULL,
                reversal_event_time INTEGER
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_price_crash_states_event_time
             ON price_crash_states (event_time DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CrashRecordStore for SqliteCrashRecordStore {
    async fn save(&self, record: &PriceCrashState) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_crash_states (
                id, highest_points, final_points, event_time, reversal_event_time
            )
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                highest_points = excluded.highest_points,
                final_points = excluded.final_points,
                event_time = excluded.event_time,
                reversal_event_time = excluded.reversal_event_time;
        "#,
        )
        .bind(record.id.to_string())
        .bind(record.highest_points)
        .bind(record.final_points)
        .bind(record.event_time)
        .bind(record.reversal_event_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: CrashId) -> anyhow::Result<Option<PriceCrashState>> {
        let row = sqlx::query("SELECT * FROM price_crash_states WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    async fn list(
        &self,
        limit: u32,
        start_at_event_time: Option<i64>,
    ) -> anyhow::Result<Vec<PriceCrashState>> {
        let rows = match start_at_event_time {
            Some(cursor) => {
                sqlx::query(
                    "SELECT * FROM price_crash_states
                     WHERE event_time < ?
                     ORDER BY event_time DESC
                     LIMIT ?",
                )
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM price_crash_states
                     ORDER BY event_time DESC
                     LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<PriceCrashState> {
    let id_str: String = row.get("id");
    let id = uuid::Uuid::parse_str(&id_str)
        .map_err(|e| anyhow::anyhow!("corrupt crash record id '{}': {}", id_str, e))?;

    Ok(PriceCrashState {
        id,
        highest_points: row.get("highest_points"),
        final_points: row.get("final_points"),
        event_time: row.get("event_time"),
        reversal_event_time: row.get("reversal_event_time"),
    })
}
