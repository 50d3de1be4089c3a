//! Configuration for the compression pipeline and watchdog.
//!
//! All values are immutable after construction. Loading from a config file
//! or CLI is the caller's concern; this crate only defines the shape.

use serde::Deserialize;

use crate::compression::CompressionMode;

/// Top-level configuration accepted by [`CompressionPipeline`](crate::pipeline::CompressionPipeline)
/// and [`WatchdogService`](crate::pipeline::WatchdogService).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SquishConfig {
    pub mode: CompressionMode,
    pub dry_run: bool,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub query: QueryConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for SquishConfig {
    fn default() -> Self {
        Self {
            mode: CompressionMode::Medium,
            dry_run: false,
            database: DatabaseConfig::default(),
            pipeline: PipelineConfig::default(),
            query: QueryConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 12,
        }
    }
}

/// Pipeline sizing and range bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent compression workers.
    pub worker_count: usize,
    /// Number of concurrent batch writers.
    pub writer_count: usize,
    /// Capacity of the intake and result queues. This is the primary
    /// memory bound: at most `2 * queue_capacity` payloads are in flight.
    pub queue_capacity: usize,
    /// Rows per write transaction.
    pub batch_size: usize,
    /// Lowest source id to consider (inclusive in batch mode).
    pub id_from: i64,
    /// Highest source id to consider; 0 means unbounded.
    pub id_to: i64,
    /// Row-fetch hint; also the interval for producer progress logging.
    pub fetch_size: usize,
    /// Optional per-item delay in the worker loop, for load shedding.
    pub throttle_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            writer_count: 4,
            queue_capacity: 500,
            batch_size: 200,
            id_from: 0,
            id_to: 0,
            fetch_size: 200,
            throttle_ms: 0,
        }
    }
}

impl PipelineConfig {
    pub fn has_upper_bound(&self) -> bool {
        self.id_to > 0
    }

    pub fn upper_bound(&self) -> Option<i64> {
        self.has_upper_bound().then_some(self.id_to)
    }
}

/// Names of the source tables and columns the pipeline operates on.
///
/// The master table holds one row per document; the detail table holds the
/// payload and is joined on `join_column`. Detail rows are addressed by the
/// composite `(join_column, secondary_column)` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub master_table: String,
    pub detail_table: String,
    pub tracking_table: String,
    pub id_column: String,
    pub join_column: String,
    pub secondary_column: String,
    pub filename_column: String,
    pub data_column: String,
    /// Operator-supplied predicate fragment on the master table.
    pub master_filter: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            master_table: "documents".to_string(),
            detail_table: "document_data".to_string(),
            tracking_table: "squish_processed".to_string(),
            id_column: "doc_id".to_string(),
            join_column: "doc_id".to_string(),
            secondary_column: "revision".to_string(),
            filename_column: "file_name".to_string(),
            data_column: "data".to_string(),
            master_filter: "1=1".to_string(),
        }
    }
}

/// Continuous-mode settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub poll_interval_secs: u64,
    /// How long `close()` waits for an in-flight cycle before aborting it.
    pub shutdown_grace_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}
