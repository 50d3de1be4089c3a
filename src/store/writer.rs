//! Batched persistence of compressed payloads.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::sanitize_identifier;
use super::tracking::{SqliteTrackingRepository, TrackingRecord};
use crate::config::QueryConfig;
use crate::errors::{DbError, DomainResult};
use crate::pipeline::task::SuccessRow;

/// Persists one batch of successful outcomes.
///
/// Implementations must commit the payload updates and the tracking upserts
/// atomically: a row must never be marked SUCCESS without its bytes
/// persisted, or the reverse.
#[async_trait]
pub trait PayloadWriter: Send + Sync {
    async fn write_batch(&self, batch: &[SuccessRow]) -> DomainResult<()>;
}

pub struct SqlitePayloadWriter {
    pool: SqlitePool,
    tracking: Arc<SqliteTrackingRepository>,
    update_sql: String,
    hostname: String,
}

impl SqlitePayloadWriter {
    pub fn new(
        pool: SqlitePool,
        tracking: Arc<SqliteTrackingRepository>,
        query: &QueryConfig,
    ) -> Self {
        let detail = sanitize_identifier(&query.detail_table);
        let data_col = sanitize_identifier(&query.data_column);
        let join_col = sanitize_identifier(&query.join_column);
        let secondary_col = sanitize_identifier(&query.secondary_column);

        // Keyed by the full composite id. Matching on the join column alone
        // could cross-update detail rows that share a partial key.
        let update_sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ? AND {} = ?",
            detail, data_col, join_col, secondary_col
        );

        Self {
            pool,
            tracking,
            update_sql,
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

#[async_trait]
impl PayloadWriter for SqlitePayloadWriter {
    async fn write_batch(&self, batch: &[SuccessRow]) -> DomainResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        for row in batch {
            sqlx::query(&self.update_sql)
                .bind(&row.compressed)
                .bind(row.id)
                .bind(row.secondary_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;

            let record = TrackingRecord::success(row, &self.hostname);
            self.tracking.upsert_with_tx(&record, &mut tx).await?;
        }

        tx.commit().await.map_err(DbError::from)?;
        log::debug!("[WRITER] Committed batch of {}", batch.len());
        Ok(())
    }
}

/// Drains the result queue with identical backpressure but persists nothing.
pub struct DryRunPayloadWriter;

#[async_trait]
impl PayloadWriter for DryRunPayloadWriter {
    async fn write_batch(&self, batch: &[SuccessRow]) -> DomainResult<()> {
        for row in batch {
            log::trace!(
                "[WRITER] DRY-RUN: would update id={} ({} -> {} bytes)",
                row.id,
                row.original_size,
                row.compressed_size
            );
        }
        Ok(())
    }
}
