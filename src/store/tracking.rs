//! Idempotency ledger: one row per source id, upsert semantics.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::sanitize_identifier;
use crate::errors::{DbError, DomainResult};
use crate::pipeline::task::SuccessRow;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStatus {
    Success,
    Skipped,
    Error,
}

impl TrackingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingStatus::Success => "SUCCESS",
            TrackingStatus::Skipped => "SKIPPED",
            TrackingStatus::Error => "ERROR",
        }
    }
}

/// One logical tracking row. Revisits overwrite rather than duplicate.
#[derive(Debug, Clone)]
pub struct TrackingRecord {
    pub doc_id: i64,
    pub status: TrackingStatus,
    pub original_size: i64,
    pub compressed_size: Option<i64>,
    pub savings_percent: Option<f64>,
    pub error_message: Option<String>,
    pub hostname: String,
}

impl TrackingRecord {
    pub fn success(row: &SuccessRow, hostname: &str) -> Self {
        Self {
            doc_id: row.id,
            status: TrackingStatus::Success,
            original_size: row.original_size,
            compressed_size: Some(row.compressed_size),
            savings_percent: Some(row.savings_percent()),
            error_message: None,
            hostname: hostname.to_string(),
        }
    }

    pub fn skipped(doc_id: i64, size: i64, reason: &str, hostname: &str) -> Self {
        Self {
            doc_id,
            status: TrackingStatus::Skipped,
            original_size: size,
            compressed_size: None,
            savings_percent: None,
            error_message: Some(truncate(reason)),
            hostname: hostname.to_string(),
        }
    }

    pub fn failed(doc_id: i64, message: &str, hostname: &str) -> Self {
        Self {
            doc_id,
            status: TrackingStatus::Error,
            original_size: 0,
            compressed_size: None,
            savings_percent: None,
            error_message: Some(truncate(message)),
            hostname: hostname.to_string(),
        }
    }
}

fn truncate(s: &str) -> String {
    if s.len() > MAX_ERROR_MESSAGE_LEN {
        s.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
    } else {
        s.to_string()
    }
}

/// Durable ledger of per-id processing status. Gates the producer query and
/// makes re-runs idempotent.
#[async_trait]
pub trait TrackingRepository: Send + Sync {
    async fn exists(&self, doc_id: i64) -> DomainResult<bool>;

    async fn upsert_success(&self, record: &TrackingRecord) -> DomainResult<()>;

    async fn upsert_skipped_or_failed(&self, record: &TrackingRecord) -> DomainResult<()>;
}

pub struct SqliteTrackingRepository {
    pool: SqlitePool,
    exists_sql: String,
    upsert_sql: String,
}

impl SqliteTrackingRepository {
    pub fn new(pool: SqlitePool, tracking_table: &str) -> Self {
        let table = sanitize_identifier(tracking_table);
        let exists_sql = format!("SELECT 1 FROM {} WHERE doc_id = ?", table);
        let upsert_sql = format!(
            "INSERT INTO {} \
             (doc_id, status, original_size, compressed_size, savings_percent, error_message, hostname, processed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(doc_id) DO UPDATE SET \
             status = excluded.status, \
             original_size = excluded.original_size, \
             compressed_size = excluded.compressed_size, \
             savings_percent = excluded.savings_percent, \
             error_message = excluded.error_message, \
             hostname = excluded.hostname, \
             processed_at = excluded.processed_at",
            table
        );
        Self {
            pool,
            exists_sql,
            upsert_sql,
        }
    }

    /// Create the tracking table if it is missing. The source/detail tables
    /// belong to the host application and are never touched here.
    pub async fn ensure_schema(pool: &SqlitePool, tracking_table: &str) -> DomainResult<()> {
        let table = sanitize_identifier(tracking_table);
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             doc_id INTEGER PRIMARY KEY, \
             status TEXT NOT NULL, \
             original_size INTEGER NOT NULL DEFAULT 0, \
             compressed_size INTEGER, \
             savings_percent REAL, \
             error_message TEXT, \
             hostname TEXT, \
             processed_at TEXT NOT NULL)",
            table
        );
        sqlx::query(&ddl)
            .execute(pool)
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    /// Upsert within an existing transaction, for callers that must commit
    /// the tracking row atomically with a payload write.
    pub async fn upsert_with_tx(
        &self,
        record: &TrackingRecord,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(&self.upsert_sql)
            .bind(record.doc_id)
            .bind(record.status.as_str())
            .bind(record.original_size)
            .bind(record.compressed_size)
            .bind(record.savings_percent)
            .bind(record.error_message.as_deref())
            .bind(&record.hostname)
            .bind(&now)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn upsert(&self, record: &TrackingRecord) -> DomainResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(&self.upsert_sql)
            .bind(record.doc_id)
            .bind(record.status.as_str())
            .bind(record.original_size)
            .bind(record.compressed_size)
            .bind(record.savings_percent)
            .bind(record.error_message.as_deref())
            .bind(&record.hostname)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}

#[async_trait]
impl TrackingRepository for SqliteTrackingRepository {
    async fn exists(&self, doc_id: i64) -> DomainResult<bool> {
        let row = sqlx::query(&self.exists_sql)
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(row.is_some())
    }

    async fn upsert_success(&self, record: &TrackingRecord) -> DomainResult<()> {
        self.upsert(record).await
    }

    async fn upsert_skipped_or_failed(&self, record: &TrackingRecord) -> DomainResult<()> {
        self.upsert(record).await
    }
}
