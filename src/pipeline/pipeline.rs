//! Bounded batch pipeline: producer -> worker pool -> writer pool.
//!
//! Producer and workers are joined before the result-queue sentinels are
//! injected, so the sentinel count always matches the configured writer
//! count. Per-item failures never abort the run; only bootstrap failures
//! (pool connect, schema check) propagate.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use super::task::{PdfTask, ResultMessage, SuccessRow, WorkItem};
use super::tracker::ProgressTracker;
use crate::compression::{CompressionMode, CompressionOutcome, Compressor, DeflateCompressor};
use crate::config::SquishConfig;
use crate::errors::{DbError, DomainError, DomainResult};
use crate::store::{
    DryRunPayloadWriter, PayloadWriter, SourceRepository, SqlitePayloadWriter,
    SqliteSourceRepository, SqliteTrackingRepository, TrackingRecord, TrackingRepository,
};

/// Synthetic dead-letter id recorded when the producer itself fails.
const PRODUCER_ERROR_ID: i64 = -999;
/// Synthetic dead-letter id recorded when a write batch fails.
const WRITER_ERROR_ID: i64 = -997;

/// One bounded compression run over a configured id range.
pub struct CompressionPipeline {
    config: SquishConfig,
    tracker: Arc<ProgressTracker>,
    compressor: Arc<dyn Compressor>,
    source: Arc<dyn SourceRepository>,
    tracking: Arc<dyn TrackingRepository>,
    writer: Arc<dyn PayloadWriter>,
    hostname: String,
}

impl CompressionPipeline {
    /// Open a connection pool and wire up the sqlite-backed stages.
    /// This is the only fatal path: a pool or schema failure aborts startup.
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
        let concurrency = config.pipeline.worker_count + config.pipeline.writer_count;
        if (config.database.max_connections as usize) <= concurrency {
            // A stage blocked on a connection while holding a queue slot
            // another stage needs can deadlock the run.
            log::warn!(
                "[PIPELINE] pool size {} does not exceed worker+writer concurrency {}",
                config.database.max_connections,
                concurrency
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
                pool,
                tracking.clone(),
                &config.query,
            ))
        };

        Self::with_components(
            config,
            tracker,
            Arc::new(DeflateCompressor),
            source,
            tracking,
            writer,
        )
    }

    /// Assemble a pipeline from explicit stage implementations.
    pub fn with_components(
        config: SquishConfig,
        tracker: Arc<ProgressTracker>,
        compressor: Arc<dyn Compressor>,
        source: Arc<dyn SourceRepository>,
        tracking: Arc<dyn TrackingRepository>,
        writer: Arc<dyn PayloadWriter>,
    ) -> Self {
        log::info!(
            "[PIPELINE] initialized with {} workers / {} writers, mode: {:?}{}",
            config.pipeline.worker_count,
            config.pipeline.writer_count,
            config.mode,
            if config.dry_run { " (dry-run)" } else { "" }
        );
        Self {
            config,
            tracker,
            compressor,
            source,
            tracking,
            writer,
            hostname: whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string()),
        }
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Measure the unprocessed backlog (count and bytes) for the tracker's
    /// progress and projection metrics. Failures are logged, not fatal.
    pub async fn calculate_initial_stats(&self) {
        match self
            .source
            .count_and_total_size(self.config.pipeline.id_from)
            .await
        {
            Ok((count, size)) => {
                self.tracker.set_initial_stats(count, size);
                log::info!(
                    "[PIPELINE] initial stats: {} records, {:.2} MB",
                    count,
                    size as f64 / 1024.0 / 1024.0
                );
            }
            Err(e) => log::error!("[PIPELINE] failed to calculate initial stats: {}", e),
        }
    }

    /// Measure the range's total size after the run.
    pub async fn calculate_final_stats(&self) {
        match self.source.total_size(self.config.pipeline.id_from).await {
            Ok(size) => {
                self.tracker.set_final_db_size(size);
                log::info!(
                    "[PIPELINE] final DB size: {:.2} MB",
                    size as f64 / 1024.0 / 1024.0
                );
            }
            Err(e) => log::error!("[PIPELINE] failed to calculate final stats: {}", e),
        }
    }

    /// Run the complete pipeline to exhaustion of the configured range.
    pub async fn run(&self) -> DomainResult<()> {
        let pipeline = &self.config.pipeline;
        self.tracker.mark_started();
        log::info!("[PIPELINE] starting compression pipeline");

        let (task_tx, task_rx) = mpsc::channel::<PdfTask>(pipeline.queue_capacity);
        let (result_tx, result_rx) = mpsc::channel::<ResultMessage>(pipeline.queue_capacity);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let result_rx = Arc::new(Mutex::new(result_rx));
        let worker_semaphore = Arc::new(Semaphore::new(pipeline.worker_count));

        let producer = tokio::spawn(run_producer(
            self.source.clone(),
            self.tracker.clone(),
            task_tx,
            pipeline.id_from,
            pipeline.worker_count,
            pipeline.fetch_size.max(1) as u64,
        ));

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(pipeline.worker_count);
        for idx in 0..pipeline.worker_count {
            workers.push(tokio::spawn(run_worker(WorkerContext {
                idx,
                task_rx: task_rx.clone(),
                result_tx: result_tx.clone(),
                compressor: self.compressor.clone(),
                tracker: self.tracker.clone(),
                tracking: self.tracking.clone(),
                semaphore: worker_semaphore.clone(),
                mode: self.config.mode,
                dry_run: self.config.dry_run,
                throttle_ms: pipeline.throttle_ms,
                hostname: self.hostname.clone(),
            })));
        }

        let mut writers: Vec<JoinHandle<()>> = Vec::with_capacity(pipeline.writer_count);
        for idx in 0..pipeline.writer_count {
            writers.push(tokio::spawn(run_writer(
                idx,
                result_rx.clone(),
                self.writer.clone(),
                self.tracker.clone(),
                pipeline.batch_size.max(1),
            )));
        }

        producer
            .await
            .map_err(|e| DomainError::Internal(format!("producer task join error: {}", e)))?;
        log::info!("[PIPELINE] producer completed");

        for handle in workers {
            handle
                .await
                .map_err(|e| DomainError::Internal(format!("worker task join error: {}", e)))?;
        }
        log::info!("[PIPELINE] workers completed");

        // Workers are all down, so the writer count is the exact number of
        // sentinels still owed on the result queue.
        for _ in 0..pipeline.writer_count {
            if result_tx.send(ResultMessage::Sentinel).await.is_err() {
                break;
            }
        }
        drop(result_tx);

        for handle in writers {
            handle
                .await
                .map_err(|e| DomainError::Internal(format!("writer task join error: {}", e)))?;
        }
        log::info!("[PIPELINE] writers completed");

        self.tracker.mark_completed();
        log::info!(
            "[PIPELINE] completed in {:?}: {} read, {} compressed, {} skipped, {} updated, {} errors",
            self.tracker.elapsed(),
            self.tracker.read_count(),
            self.tracker.compressed_count(),
            self.tracker.skipped_count(),
            self.tracker.updated_count(),
            self.tracker.error_count(),
        );
        Ok(())
    }
}

async fn run_producer(
    source: Arc<dyn SourceRepository>,
    tracker: Arc<ProgressTracker>,
    task_tx: mpsc::Sender<PdfTask>,
    id_from: i64,
    worker_count: usize,
    log_every: u64,
) {
    {
        let mut stream = source.stream_candidates(id_from, true);
        while let Some(next) = stream.next().await {
            match next {
                Ok(record) => {
                    tracker.record_read();
                    let read = tracker.read_count();
                    if read % log_every == 0 {
                        log::debug!("[PRODUCER] {} rows read", read);
                    }
                    let item = WorkItem {
                        id: record.id,
                        secondary_id: record.secondary_id,
                        filename: record.filename,
                        payload: record.payload,
                    };
                    // Blocks when the queue is full; this is the memory bound.
                    if task_tx.send(PdfTask::Item(item)).await.is_err() {
                        log::warn!("[PRODUCER] intake queue closed, stopping");
                        break;
                    }
                }
                Err(e) => {
                    log::error!("[PRODUCER] enumeration failed: {}", e);
                    tracker.record_error(PRODUCER_ERROR_ID, &e.to_string());
                    break;
                }
            }
        }
    }

    // Sentinels go out on every exit path, success or failure. A failed
    // producer must not leave the workers starved forever.
    for _ in 0..worker_count {
        if task_tx.send(PdfTask::Sentinel).await.is_err() {
            break;
        }
    }
    log::debug!(
        "[PRODUCER] finished after {} rows, {} sentinels sent",
        tracker.read_count(),
        worker_count
    );
}

struct WorkerContext {
    idx: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<PdfTask>>>,
    result_tx: mpsc::Sender<ResultMessage>,
    compressor: Arc<dyn Compressor>,
    tracker: Arc<ProgressTracker>,
    tracking: Arc<dyn TrackingRepository>,
    semaphore: Arc<Semaphore>,
    mode: CompressionMode,
    dry_run: bool,
    throttle_ms: u64,
    hostname: String,
}

async fn run_worker(ctx: WorkerContext) {
    loop {
        let task = { ctx.task_rx.lock().await.recv().await };
        let item = match task {
            Some(PdfTask::Item(item)) => item,
            Some(PdfTask::Sentinel) => {
                log::debug!("[WORKER-{}] received sentinel, stopping", ctx.idx);
                break;
            }
            None => break,
        };

        let _permit = match ctx.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        log::trace!("[WORKER-{}] compressing id={} ({})", ctx.idx, item.id, item.filename);
        let outcome = ctx
            .compressor
            .compress(item.id, item.secondary_id, &item.filename, item.payload, ctx.mode)
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
                let row = SuccessRow {
                    id,
                    secondary_id,
                    filename,
                    compressed,
                    original_size,
                    compressed_size,
                };
                if ctx.result_tx.send(ResultMessage::Item(row)).await.is_err() {
                    log::warn!("[WORKER-{}] result queue closed, stopping", ctx.idx);
                    break;
                }
            }
            // Nothing to persist; track inline so the row is never revisited.
            CompressionOutcome::Skipped {
                id, size, reason, ..
            } => {
                if !ctx.dry_run {
                    let record = TrackingRecord::skipped(id, size, &reason, &ctx.hostname);
                    if let Err(e) = ctx.tracking.upsert_skipped_or_failed(&record).await {
                        log::warn!("[WORKER-{}] failed to track skipped id {}: {}", ctx.idx, id, e);
                    }
                }
            }
            CompressionOutcome::Failure { id, message, .. } => {
                if !ctx.dry_run {
                    let record = TrackingRecord::failed(id, &message, &ctx.hostname);
                    if let Err(e) = ctx.tracking.upsert_skipped_or_failed(&record).await {
                        log::warn!("[WORKER-{}] failed to track error id {}: {}", ctx.idx, id, e);
                    }
                }
            }
        }

        if ctx.throttle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(ctx.throttle_ms)).await;
        }
    }
}

async fn run_writer(
    idx: usize,
    result_rx: Arc<Mutex<mpsc::Receiver<ResultMessage>>>,
    writer: Arc<dyn PayloadWriter>,
    tracker: Arc<ProgressTracker>,
    batch_size: usize,
) {
    let mut batch: Vec<SuccessRow> = Vec::with_capacity(batch_size);

    loop {
        let message = { result_rx.lock().await.recv().await };
        match message {
            Some(ResultMessage::Item(row)) => {
                batch.push(row);
                if batch.len() >= batch_size {
                    flush_batch(idx, writer.as_ref(), &tracker, &mut batch).await;
                }
            }
            Some(ResultMessage::Sentinel) | None => break,
        }
    }

    // Partial batch left over when the sentinel arrived.
    flush_batch(idx, writer.as_ref(), &tracker, &mut batch).await;
    log::debug!("[WRITER-{}] stopping", idx);
}

async fn flush_batch(
    idx: usize,
    writer: &dyn PayloadWriter,
    tracker: &ProgressTracker,
    batch: &mut Vec<SuccessRow>,
) {
    if batch.is_empty() {
        return;
    }
    match writer.write_batch(batch).await {
        Ok(()) => {
            for _ in batch.iter() {
                tracker.record_update();
            }
        }
        Err(e) => {
            log::error!("[WRITER-{}] batch of {} failed: {}", idx, batch.len(), e);
            tracker.record_error(WRITER_ERROR_ID, &e.to_string());
        }
    }
    batch.clear();
}
