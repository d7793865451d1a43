//! Record store contract + SQLite implementation for the reconciliation engine.

use agora_core::{EventRecord, EventType};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, SqlitePool};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "agora-store";

/// SQLite's default bound-parameter ceiling is 999; stay well under it.
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// The engine's whole view of persistence: one working-set read at run
/// start, point deletes per pass. The store owns the "still relevant"
/// restriction; the engine never reconstructs it.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_working_set(&self, now: NaiveDateTime) -> Result<Vec<EventRecord>, StoreError>;

    /// Deletes the given records, returning the number of rows affected.
    async fn delete_records(&self, ids: &[String]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn load_working_set(&self, now: NaiveDateTime) -> Result<Vec<EventRecord>, StoreError> {
        let cutoff = now.format("%Y-%m-%dT%H:%M:%S").to_string();
        let rows = sqlx::query(
            "SELECT id, title, venue_name, start_date, type, source, url, \
                    LENGTH(COALESCE(description, '')) AS description_len \
             FROM events \
             WHERE start_date >= ?1 \
             ORDER BY id",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let raw_start: String = row.try_get("start_date")?;
            let Some(start) = parse_event_timestamp(&raw_start) else {
                warn!(id = %id, raw_start = %raw_start, "skipping record with unparseable start timestamp");
                continue;
            };
            let type_label: String = row.try_get("type")?;
            records.push(EventRecord {
                id,
                title: row.try_get("title")?,
                venue_name: row.try_get("venue_name")?,
                start,
                event_type: EventType::parse(&type_label),
                source: row.try_get("source")?,
                url: row.try_get("url")?,
                description_len: row.try_get::<i64, _>("description_len")?.max(0) as u32,
            });
        }
        Ok(records)
    }

    async fn delete_records(&self, ids: &[String]) -> Result<u64, StoreError> {
        let mut affected = 0u64;
        for chunk in ids.chunks(DELETE_CHUNK) {
            if chunk.is_empty() {
                continue;
            }
            let mut builder = QueryBuilder::new("DELETE FROM events WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            builder.push(")");
            let result = builder.build().execute(&self.pool).await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }
}

/// Scraped feeds disagree on timestamp shape: RFC 3339 with a spurious
/// offset, bare ISO date-times, or a date with no time at all (which
/// becomes midnight, later treated as a sentinel).
pub fn parse_event_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}
