//! Continuous mode: poll for new rows past a high-water mark and compress
//! them as they arrive.
//!
//! Cycles are serialized; the poll interval is measured sleep-after-cycle,
//! so a slow cycle never overlaps the next one. The high-water mark
//! advances at read time, and rows already present in the tracking table
//! are excluded by the candidate query, so a crash between cycles costs at
//! most one re-read of already-tracked ids.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

use super::task::SuccessRow;
use super::tracker::ProgressTracker;
use crate::compression::{CompressionMode, CompressionOutcome, Compressor, DeflateCompressor};
use crate::config::SquishConfig;
use crate::errors::{DbError, DomainResult};
use crate::store::{
    DryRunPayloadWriter, PayloadWriter, SourceRecord, SourceRepository, SqlitePayloadWriter,
    SqliteSourceRepository, SqliteTrackingRepository, TrackingRecord, TrackingRepository,
};

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// Synthetic dead-letter id recorded when a cycle's enumeration fails.
const CYCLE_ERROR_ID: i64 = -998;

/// What one completed poll cycle accomplished.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub records: u64,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub savings_percent: f64,
    pub last_processed_id: i64,
    pub dry_run: bool,
}

/// Receives a summary after every cycle that processed at least one record.
/// The production deployment hangs its report delivery off this seam.
#[async_trait]
pub trait CycleObserver: Send + Sync {
    async fn cycle_finished(&self, summary: &CycleSummary);
}

/// Point-in-time view of the watchdog for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub running: bool,
    pub cycle_count: u64,
    pub last_processed_id: i64,
    pub last_cycle_records: u64,
    pub poll_interval_secs: u64,
    /// Seconds until the next cycle is due, `None` before the first
    /// cycle has completed.
    pub next_cycle_in_secs: Option<u64>,
}

/// Long-running poller that compresses rows beyond a moving high-water mark.
pub struct WatchdogService {
    config: SquishConfig,
    tracker: Arc<ProgressTracker>,
    compressor: Arc<dyn Compressor>,
    source: Arc<dyn SourceRepository>,
    tracking: Arc<dyn TrackingRepository>,
    writer: Arc<dyn PayloadWriter>,
    observer: Option<Arc<dyn CycleObserver>>,
    state: AtomicU8,
    cycle_count: AtomicU64,
    last_processed_id: AtomicI64,
    last_cycle_records: AtomicU64,
    worker_semaphore: Arc<Semaphore>,
    shutdown: Notify,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    // Per-record tasks of the cycle in flight; drained by the cycle itself,
    // aborted by `close` when the grace period runs out.
    in_flight: StdMutex<Vec<JoinHandle<()>>>,
    last_cycle_at: StdMutex<Option<Instant>>,
    pool: Option<SqlitePool>,
    hostname: String,
}

impl WatchdogService {
    /// Open a connection pool and wire up the sqlite-backed stages.
    pub async fn connect(
        config: SquishConfig,
        tracker: Arc<ProgressTracker>,
    ) -> DomainResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await
            .map_err(|e| DbError::ConnectionPool(e.to_string()))?;
        SqliteTrackingRepository::ensure_schema(&pool, &config.query.tracking_table).await?;
        Ok(Self::from_pool(pool, config, tracker))
    }

    /// Wire up the sqlite-backed stages over an existing pool.
    pub fn from_pool(pool: SqlitePool, config: SquishConfig, tracker: Arc<ProgressTracker>) -> Self {
        if (config.database.max_connections as usize) <= config.pipeline.worker_count {
            // A record task blocked on a connection while the cycle holds
            // its own can deadlock the poll.
            log::warn!(
                "[WATCHDOG] pool size {} does not exceed worker concurrency {}",
                config.database.max_connections,
                config.pipeline.worker_count
            );
        }
        let tracking = Arc::new(SqliteTrackingRepository::new(
            pool.clone(),
            &config.query.tracking_table,
        ));
        let source = Arc::new(SqliteSourceRepository::new(
            pool.clone(),
            &config.query,
            &config.pipeline,
        ));
        let writer: Arc<dyn PayloadWriter> = if config.dry_run {
            Arc::new(DryRunPayloadWriter)
        } else {
            Arc::new(SqlitePayloadWriter::new(
                pool.clone(),
                tracking.clone(),
                &config.query,
            ))
        };
        let mut service = Self::with_components(
            config,
            tracker,
            Arc::new(DeflateCompressor),
            source,
            tracking,
            writer,
        );
        service.pool = Some(pool);
        service
    }

    /// Assemble a watchdog from explicit stage implementations.
    pub fn with_components(
        config: SquishConfig,
        tracker: Arc<ProgressTracker>,
        compressor: Arc<dyn Compressor>,
        source: Arc<dyn SourceRepository>,
        tracking: Arc<dyn TrackingRepository>,
        writer: Arc<dyn PayloadWriter>,
    ) -> Self {
        let worker_count = config.pipeline.worker_count;
        // The poll is strictly above the watermark, so starting one below
        // `id_from` makes the first cycle inclusive of it.
        let initial_watermark = config.pipeline.id_from.saturating_sub(1);
        Self {
            config,
            tracker,
            compressor,
            source,
            tracking,
            writer,
            observer: None,
            state: AtomicU8::new(STATE_STOPPED),
            cycle_count: AtomicU64::new(0),
            last_processed_id: AtomicI64::new(initial_watermark),
            last_cycle_records: AtomicU64::new(0),
            worker_semaphore: Arc::new(Semaphore::new(worker_count)),
            shutdown: Notify::new(),
            scheduler: Mutex::new(None),
            in_flight: StdMutex::new(Vec::new()),
            last_cycle_at: StdMutex::new(None),
            pool: None,
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    /// Attach a per-cycle observer. Call before `start`.
    pub fn with_observer(mut self, observer: Arc<dyn CycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Begin polling. Runs one cycle immediately, then every poll interval.
    /// A second `start` while running is a logged no-op.
    pub async fn start(self: Arc<Self>) {
        if self
            .state
            .compare_exchange(STATE_STOPPED, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("[WATCHDOG] start ignored, already running");
            return;
        }

        self.tracker.mark_started();
        self.calculate_baseline_stats().await;

        // First cycle runs inline so the backlog is drained before the
        // poll cadence begins.
        self.run_cycle().await;

        let service = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                let sleep =
                    tokio::time::sleep(Duration::from_secs(service.config.watchdog.poll_interval_secs));
                tokio::select! {
                    _ = sleep => {}
                    _ = service.shutdown.notified() => break,
                }
                if service.state.load(Ordering::SeqCst) != STATE_RUNNING {
                    break;
                }
                service.run_cycle().await;
            }
            log::debug!("[WATCHDOG] scheduler loop exited");
        });
        *self.scheduler.lock().await = Some(handle);

        log::info!(
            "[WATCHDOG] started - polling every {}s, watermark at id {}",
            self.config.watchdog.poll_interval_secs,
            self.last_processed_id.load(Ordering::SeqCst)
        );
    }

    /// Run a single poll cycle and return the number of records processed.
    /// Public so callers (and tests) can drive cycles deterministically.
    pub async fn run_cycle(&self) -> u64 {
        let cycle = self.cycle_count.fetch_add(1, Ordering::SeqCst) + 1;
        let watermark = self.last_processed_id.load(Ordering::SeqCst);
        log::info!("[WATCHDOG] cycle {} starting from id > {}", cycle, watermark);

        let cycle_original = Arc::new(AtomicU64::new(0));
        let cycle_compressed = Arc::new(AtomicU64::new(0));
        let mut processed: u64 = 0;

        {
            // Strictly greater than the watermark: the marked row itself is done.
            let mut stream = self.source.stream_candidates(watermark, false);
            while let Some(next) = stream.next().await {
                let record = match next {
                    Ok(record) => record,
                    Err(e) => {
                        // Abort only this cycle; the next poll retries from
                        // the same watermark.
                        log::error!("[WATCHDOG] cycle {} enumeration failed: {}", cycle, e);
                        self.tracker.record_error(CYCLE_ERROR_ID, &e.to_string());
                        break;
                    }
                };
                self.tracker.record_read();
                self.last_processed_id.fetch_max(record.id, Ordering::SeqCst);
                processed += 1;

                let permit = match self.worker_semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let ctx = RecordContext {
                    compressor: self.compressor.clone(),
                    tracker: self.tracker.clone(),
                    tracking: self.tracking.clone(),
                    writer: self.writer.clone(),
                    mode: self.config.mode,
                    dry_run: self.config.dry_run,
                    hostname: self.hostname.clone(),
                    cycle_original: cycle_original.clone(),
                    cycle_compressed: cycle_compressed.clone(),
                };
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    process_record(ctx, record).await;
                });
                self.in_flight.lock().unwrap().push(handle);

                if self.config.pipeline.throttle_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.config.pipeline.throttle_ms))
                        .await;
                }
            }
        }

        let handles: Vec<JoinHandle<()>> = self.in_flight.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("[WATCHDOG] worker task join error: {}", e);
            }
        }

        self.last_cycle_records.store(processed, Ordering::SeqCst);
        *self.last_cycle_at.lock().unwrap() = Some(Instant::now());
        let original = cycle_original.load(Ordering::SeqCst);
        let compressed = cycle_compressed.load(Ordering::SeqCst);
        log::info!(
            "[WATCHDOG] cycle {} completed: {} records, {:.2} MB -> {:.2} MB",
            cycle,
            processed,
            original as f64 / 1024.0 / 1024.0,
            compressed as f64 / 1024.0 / 1024.0
        );

        if processed > 0 {
            if let Some(observer) = &self.observer {
                let savings_percent = if original > 0 {
                    (1.0 - compressed as f64 / original as f64) * 100.0
                } else {
                    0.0
                };
                let summary = CycleSummary {
                    cycle,
                    records: processed,
                    original_bytes: original,
                    compressed_bytes: compressed,
                    savings_percent,
                    last_processed_id: self.last_processed_id.load(Ordering::SeqCst),
                    dry_run: self.config.dry_run,
                };
                observer.cycle_finished(&summary).await;
            }
        }

        processed
    }

    pub fn status(&self) -> WatchdogStatus {
        let interval = Duration::from_secs(self.config.watchdog.poll_interval_secs);
        let next_cycle_in_secs = self
            .last_cycle_at
            .lock()
            .unwrap()
            .map(|at| interval.saturating_sub(at.elapsed()).as_secs());
        WatchdogStatus {
            running: self.state.load(Ordering::SeqCst) == STATE_RUNNING,
            cycle_count: self.cycle_count.load(Ordering::SeqCst),
            last_processed_id: self.last_processed_id.load(Ordering::SeqCst),
            last_cycle_records: self.last_cycle_records.load(Ordering::SeqCst),
            poll_interval_secs: self.config.watchdog.poll_interval_secs,
            next_cycle_in_secs,
        }
    }

    /// Stop polling. Waits up to the configured grace period for an
    /// in-flight cycle, then aborts it. Idempotent.
    pub async fn close(&self) {
        if self
            .state
            .compare_exchange(STATE_RUNNING, STATE_STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        log::info!("[WATCHDOG] shutting down");
        self.shutdown.notify_one();

        let handle = self.scheduler.lock().await.take();
        if let Some(mut handle) = handle {
            let grace = Duration::from_secs(self.config.watchdog.shutdown_grace_secs);
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                log::warn!(
                    "[WATCHDOG] cycle did not finish within {}s grace, aborting",
                    self.config.watchdog.shutdown_grace_secs
                );
                handle.abort();
                // The aborted cycle leaves its record tasks behind; cancel
                // them too so close() means stopped.
                for task in self.in_flight.lock().unwrap().drain(..) {
                    task.abort();
                }
            }
        }

        if let Some(pool) = &self.pool {
            pool.close().await;
        }

        self.state.store(STATE_STOPPED, Ordering::SeqCst);
        self.tracker.mark_completed();
        log::info!(
            "[WATCHDOG] stopped after {} cycles, watermark at id {}",
            self.cycle_count.load(Ordering::SeqCst),
            self.last_processed_id.load(Ordering::SeqCst)
        );
    }

    async fn calculate_baseline_stats(&self) {
        match self
            .source
            .count_and_total_size(self.config.pipeline.id_from)
            .await
        {
            Ok((count, size)) => {
                self.tracker.set_initial_stats(count, size);
                log::info!(
                    "[WATCHDOG] baseline: {} pending records, {:.2} MB",
                    count,
                    size as f64 / 1024.0 / 1024.0
                );
            }
            Err(e) => log::error!("[WATCHDOG] failed to calculate baseline stats: {}", e),
        }
    }
}

struct RecordContext {
    compressor: Arc<dyn Compressor>,
    tracker: Arc<ProgressTracker>,
    tracking: Arc<dyn TrackingRepository>,
    writer: Arc<dyn PayloadWriter>,
    mode: CompressionMode,
    dry_run: bool,
    hostname: String,
    cycle_original: Arc<AtomicU64>,
    cycle_compressed: Arc<AtomicU64>,
}

/// Compress and persist one record. Single-row batches keep the watchdog
/// path simple; throughput in continuous mode is bounded by arrival rate,
/// not write batching.
async fn process_record(ctx: RecordContext, record: SourceRecord) {
    let outcome = ctx
        .compressor
        .compress(
            record.id,
            record.secondary_id,
            &record.filename,
            record.payload,
            ctx.mode,
        )
        .await;
    ctx.tracker.record_outcome(&outcome);

    match outcome {
        CompressionOutcome::Success {
            id,
            secondary_id,
            filename,
            compressed,
            original_size,
            compressed_size,
            ..
        } => {
            ctx.cycle_original
                .fetch_add(original_size as u64, Ordering::SeqCst);
            ctx.cycle_compressed
                .fetch_add(compressed_size as u64, Ordering::SeqCst);
            let row = SuccessRow {
                id,
                secondary_id,
                filename,
                compressed,
                original_size,
                compressed_size,
            };
            match ctx.writer.write_batch(std::slice::from_ref(&row)).await {
                Ok(()) => ctx.tracker.record_update(),
                Err(e) => {
                    log::error!("[WATCHDOG] failed to persist id {}: {}", id, e);
                    ctx.tracker.record_error(id, &e.to_string());
                }
            }
        }
        CompressionOutcome::Skipped {
            id, size, reason, ..
        } => {
            if !ctx.dry_run {
                let record = TrackingRecord::skipped(id, size, &reason, &ctx.hostname);
                if let Err(e) = ctx.tracking.upsert_skipped_or_failed(&record).await {
                    log::warn!("[WATCHDOG] failed to track skipped id {}: {}", id, e);
                }
            }
        }
        CompressionOutcome::Failure { id, message, .. } => {
            if !ctx.dry_run {
                let record = TrackingRecord::failed(id, &message, &ctx.hostname);
                if let Err(e) = ctx.tracking.upsert_skipped_or_failed(&record).await {
                    log::warn!("[WATCHDOG] failed to track error id {}: {}", id, e);
                }
            }
        }
    }
}
