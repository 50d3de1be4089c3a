//! Enumeration of unprocessed source rows and baseline statistics.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::{Row, SqlitePool};

use super::sanitize_identifier;
use crate::config::{PipelineConfig, QueryConfig};
use crate::errors::{DbError, DomainError, DomainResult};

/// One candidate row from the master/detail join. Read-only.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub id: i64,
    pub secondary_id: i64,
    pub filename: String,
    pub payload: Vec<u8>,
}

/// Read access to the master/detail join, excluding rows already tracked.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Stream candidate rows with id `>= from` (inclusive) or `> from`
    /// (exclusive), in id order. Backed by a row cursor; rows are
    /// materialized one at a time so queue backpressure bounds memory.
    fn stream_candidates(
        &self,
        from: i64,
        inclusive: bool,
    ) -> BoxStream<'_, DomainResult<SourceRecord>>;

    /// Count and total payload bytes of the unprocessed candidates,
    /// for baseline statistics.
    async fn count_and_total_size(&self, from: i64) -> DomainResult<(u64, u64)>;

    /// Total payload bytes in range regardless of tracking state,
    /// for the end-of-run measurement.
    async fn total_size(&self, from: i64) -> DomainResult<u64>;
}

pub struct SqliteSourceRepository {
    pool: SqlitePool,
    id_to: Option<i64>,
    select_from_sql: String,
    select_after_sql: String,
    count_sql: String,
    total_size_sql: String,
}

impl SqliteSourceRepository {
    pub fn new(pool: SqlitePool, query: &QueryConfig, pipeline: &PipelineConfig) -> Self {
        let master = sanitize_identifier(&query.master_table);
        let detail = sanitize_identifier(&query.detail_table);
        let tracking = sanitize_identifier(&query.tracking_table);
        let id_col = sanitize_identifier(&query.id_column);
        let join_col = sanitize_identifier(&query.join_column);
        let secondary_col = sanitize_identifier(&query.secondary_column);
        let filename_col = sanitize_identifier(&query.filename_column);
        let data_col = sanitize_identifier(&query.data_column);
        // The filter is an operator-supplied predicate fragment, trusted as-is.
        let filter = &query.master_filter;

        let upper = if pipeline.has_upper_bound() {
            format!(" AND m.{} <= ?", id_col)
        } else {
            String::new()
        };

        let select = |op: &str| {
            format!(
                "SELECT m.{id} AS id, d.{sec} AS secondary_id, m.{name} AS filename, d.{data} AS payload \
                 FROM {master} m \
                 INNER JOIN {detail} d ON m.{id} = d.{join} \
                 WHERE ({filter}) \
                 AND d.{data} IS NOT NULL \
                 AND m.{id} {op} ? \
                 AND NOT EXISTS (SELECT 1 FROM {tracking} sp WHERE sp.doc_id = m.{id}){upper} \
                 ORDER BY m.{id}",
                id = id_col,
                sec = secondary_col,
                name = filename_col,
                data = data_col,
                master = master,
                detail = detail,
                join = join_col,
                filter = filter,
                tracking = tracking,
                op = op,
                upper = upper,
            )
        };

        let count_sql = format!(
            "SELECT COUNT(*) AS cnt, COALESCE(SUM(LENGTH(d.{data})), 0) AS total_size \
             FROM {master} m \
             INNER JOIN {detail} d ON m.{id} = d.{join} \
             WHERE ({filter}) \
             AND d.{data} IS NOT NULL \
             AND m.{id} >= ? \
             AND NOT EXISTS (SELECT 1 FROM {tracking} sp WHERE sp.doc_id = m.{id}){upper}",
            id = id_col,
            data = data_col,
            master = master,
            detail = detail,
            join = join_col,
            filter = filter,
            tracking = tracking,
            upper = upper,
        );

        let total_size_sql = format!(
            "SELECT COALESCE(SUM(LENGTH(d.{data})), 0) AS total_size \
             FROM {master} m \
             INNER JOIN {detail} d ON m.{id} = d.{join} \
             WHERE ({filter}) \
             AND d.{data} IS NOT NULL \
             AND m.{id} >= ?{upper}",
            id = id_col,
            data = data_col,
            master = master,
            detail = detail,
            join = join_col,
            filter = filter,
            upper = upper,
        );

        Self {
            pool,
            id_to: pipeline.upper_bound(),
            select_from_sql: select(">="),
            select_after_sql: select(">"),
            count_sql,
            total_size_sql,
        }
    }

    fn row_to_record(row: sqlx::sqlite::SqliteRow) -> DomainResult<SourceRecord> {
        let id: i64 = row
            .try_get("id")
            .map_err(|e| DomainError::InvalidRow(format!("id column: {}", e)))?;
        let secondary_id: i64 = row
            .try_get("secondary_id")
            .map_err(|e| DomainError::InvalidRow(format!("secondary id column: {}", e)))?;
        let filename: String = row.try_get("filename").unwrap_or_default();
        let payload: Vec<u8> = row
            .try_get("payload")
            .map_err(|e| DomainError::InvalidRow(format!("payload column: {}", e)))?;
        Ok(SourceRecord {
            id,
            secondary_id,
            filename,
            payload,
        })
    }
}

#[async_trait]
impl SourceRepository for SqliteSourceRepository {
    fn stream_candidates(
        &self,
        from: i64,
        inclusive: bool,
    ) -> BoxStream<'_, DomainResult<SourceRecord>> {
        let sql: &str = if inclusive {
            &self.select_from_sql
        } else {
            &self.select_after_sql
        };
        let mut query = sqlx::query(sql).bind(from);
        if let Some(to) = self.id_to {
            query = query.bind(to);
        }
        query
            .fetch(&self.pool)
            .map(|res| {
                res.map_err(|e| DomainError::Database(DbError::from(e)))
                    .and_then(Self::row_to_record)
            })
            .boxed()
    }

    async fn count_and_total_size(&self, from: i64) -> DomainResult<(u64, u64)> {
        let mut query = sqlx::query(&self.count_sql).bind(from);
        if let Some(to) = self.id_to {
            query = query.bind(to);
        }
        let row = query.fetch_one(&self.pool).await.map_err(DbError::from)?;
        let count: i64 = row.try_get("cnt").map_err(DbError::from)?;
        let size: i64 = row.try_get("total_size").map_err(DbError::from)?;
        Ok((count.max(0) as u64, size.max(0) as u64))
    }

    async fn total_size(&self, from: i64) -> DomainResult<u64> {
        let mut query = sqlx::query(&self.total_size_sql).bind(from);
        if let Some(to) = self.id_to {
            query = query.bind(to);
        }
        let row = query.fetch_one(&self.pool).await.map_err(DbError::from)?;
        let size: i64 = row.try_get("total_size").map_err(DbError::from)?;
        Ok(size.max(0) as u64)
    }
}
