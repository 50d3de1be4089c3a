//! Thread-safe progress tracking for the compression pipeline.
//!
//! Counters are plain atomics updated from many tasks; `snapshot()` reads
//! them without coordination, so an in-flight snapshot may be slightly torn.
//! That is acceptable because snapshots only feed observability, never
//! control decisions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compression::CompressionOutcome;

const MAX_RECENT_ACTIVITY: usize = 50;
const MAX_FAILED_RECORDS: usize = 1_000;

/// One human-inspectable line of recent activity, most recent first.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub filename: String,
    pub status: String,
    pub original_size: i64,
    pub compressed_size: i64,
    pub savings_percent: f64,
    pub time_ms: u64,
}

impl ActivityEntry {
    fn compressed(id: i64, filename: &str, original: i64, compressed: i64, time_ms: u64) -> Self {
        let savings = if original > 0 {
            (1.0 - compressed as f64 / original as f64) * 100.0
        } else {
            0.0
        };
        Self {
            id,
            filename: filename.to_string(),
            status: "COMPRESSED".to_string(),
            original_size: original,
            compressed_size: compressed,
            savings_percent: savings,
            time_ms,
        }
    }

    fn skipped(id: i64, filename: &str, size: i64) -> Self {
        Self {
            id,
            filename: filename.to_string(),
            status: "SKIPPED".to_string(),
            original_size: size,
            compressed_size: size,
            savings_percent: 0.0,
            time_ms: 0,
        }
    }

    fn failed(id: i64, filename: &str) -> Self {
        Self {
            id,
            filename: filename.to_string(),
            status: "FAILED".to_string(),
            original_size: 0,
            compressed_size: 0,
            savings_percent: 0.0,
            time_ms: 0,
        }
    }
}

/// A permanently failed row (dead letter).
#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    pub id: i64,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl FailedRecord {
    fn of(id: i64, error: &str) -> Self {
        Self {
            id,
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Progress tracking shared by every pipeline stage.
///
/// Scoped to one pipeline or watchdog instance; pass it in explicitly
/// rather than holding global state.
#[derive(Default)]
pub struct ProgressTracker {
    read_count: AtomicU64,
    compressed_count: AtomicU64,
    skipped_count: AtomicU64,
    updated_count: AtomicU64,
    error_count: AtomicU64,

    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
    skipped_bytes: AtomicU64,
    processing_time_ms: AtomicU64,

    total_records: AtomicU64,
    initial_db_size_bytes: AtomicU64,
    final_db_size_bytes: AtomicU64,

    completed: AtomicBool,
    started_at: RwLock<Option<Instant>>,
    ended_at: RwLock<Option<Instant>>,

    recent_activity: Mutex<VecDeque<ActivityEntry>>,
    failed_records: Mutex<VecDeque<FailedRecord>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- recording ----

    pub fn record_read(&self) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &CompressionOutcome) {
        match outcome {
            CompressionOutcome::Success {
                id,
                filename,
                original_size,
                compressed_size,
                duration,
                ..
            } => {
                self.compressed_count.fetch_add(1, Ordering::Relaxed);
                self.original_bytes
                    .fetch_add(*original_size as u64, Ordering::Relaxed);
                self.compressed_bytes
                    .fetch_add(*compressed_size as u64, Ordering::Relaxed);
                self.processing_time_ms
                    .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
                self.push_activity(ActivityEntry::compressed(
                    *id,
                    filename,
                    *original_size,
                    *compressed_size,
                    duration.as_millis() as u64,
                ));
            }
            CompressionOutcome::Skipped {
                id, filename, size, ..
            } => {
                self.skipped_count.fetch_add(1, Ordering::Relaxed);
                self.skipped_bytes.fetch_add(*size as u64, Ordering::Relaxed);
                self.push_activity(ActivityEntry::skipped(*id, filename, *size));
            }
            CompressionOutcome::Failure {
                id,
                filename,
                message,
                ..
            } => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                self.push_failed(FailedRecord::of(*id, message));
                self.push_activity(ActivityEntry::failed(*id, filename));
            }
        }
    }

    pub fn record_update(&self) {
        self.updated_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, id: i64, error: &str) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.push_failed(FailedRecord::of(id, error));
    }

    fn push_activity(&self, entry: ActivityEntry) {
        let mut activity = self.recent_activity.lock().unwrap();
        activity.push_front(entry);
        while activity.len() > MAX_RECENT_ACTIVITY {
            activity.pop_back();
        }
    }

    fn push_failed(&self, record: FailedRecord) {
        let mut failed = self.failed_records.lock().unwrap();
        failed.push_back(record);
        // The tracking store is authoritative for failed ids; the in-memory
        // list is a bounded convenience view.
        while failed.len() > MAX_FAILED_RECORDS {
            failed.pop_front();
        }
    }

    // ---- state ----

    pub fn set_initial_stats(&self, record_count: u64, db_size_bytes: u64) {
        self.total_records.store(record_count, Ordering::Relaxed);
        self.initial_db_size_bytes
            .store(db_size_bytes, Ordering::Relaxed);
    }

    pub fn set_final_db_size(&self, size_bytes: u64) {
        self.final_db_size_bytes.store(size_bytes, Ordering::Relaxed);
    }

    pub fn mark_started(&self) {
        *self.started_at.write().unwrap() = Some(Instant::now());
    }

    pub fn mark_completed(&self) {
        *self.ended_at.write().unwrap() = Some(Instant::now());
        self.completed.store(true, Ordering::Relaxed);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    // ---- computed metrics ----

    /// `compressed / original`, defined as 1.0 when nothing was compressed.
    pub fn compression_ratio(&self) -> f64 {
        let orig = self.original_bytes.load(Ordering::Relaxed);
        let comp = self.compressed_bytes.load(Ordering::Relaxed);
        if orig > 0 {
            comp as f64 / orig as f64
        } else {
            1.0
        }
    }

    pub fn savings_percent(&self) -> f64 {
        (1.0 - self.compression_ratio()) * 100.0
    }

    pub fn progress_percent(&self) -> f64 {
        let total = self.total_records.load(Ordering::Relaxed);
        if total > 0 {
            self.updated_count.load(Ordering::Relaxed) as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Extrapolates the observed ratio onto the pre-measured baseline size.
    /// A heuristic estimate, not exact.
    pub fn projected_final_size_bytes(&self) -> u64 {
        let processed = self.original_bytes.load(Ordering::Relaxed);
        let compressed = self.compressed_bytes.load(Ordering::Relaxed);
        let initial = self.initial_db_size_bytes.load(Ordering::Relaxed);

        if processed == 0 {
            return initial;
        }
        (initial as f64 * (compressed as f64 / processed as f64)) as u64
    }

    pub fn elapsed(&self) -> Duration {
        let started = *self.started_at.read().unwrap();
        match started {
            None => Duration::ZERO,
            Some(start) => {
                let end = self.ended_at.read().unwrap();
                match *end {
                    Some(end) => end.duration_since(start),
                    None => start.elapsed(),
                }
            }
        }
    }

    pub fn records_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs();
        if secs > 0 {
            self.updated_count.load(Ordering::Relaxed) as f64 / secs as f64
        } else {
            0.0
        }
    }

    pub fn mb_per_second(&self) -> f64 {
        let secs = self.elapsed().as_secs();
        if secs > 0 {
            self.original_bytes.load(Ordering::Relaxed) as f64 / 1024.0 / 1024.0 / secs as f64
        } else {
            0.0
        }
    }

    pub fn average_processing_time_ms(&self) -> u64 {
        let count = self.compressed_count.load(Ordering::Relaxed);
        if count > 0 {
            self.processing_time_ms.load(Ordering::Relaxed) / count
        } else {
            0
        }
    }

    // ---- accessors ----

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn compressed_count(&self) -> u64 {
        self.compressed_count.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped_count.load(Ordering::Relaxed)
    }

    pub fn updated_count(&self) -> u64 {
        self.updated_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn original_bytes(&self) -> u64 {
        self.original_bytes.load(Ordering::Relaxed)
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes.load(Ordering::Relaxed)
    }

    pub fn recent_activity(&self) -> Vec<ActivityEntry> {
        self.recent_activity.lock().unwrap().iter().cloned().collect()
    }

    pub fn failed_records(&self) -> Vec<FailedRecord> {
        self.failed_records.lock().unwrap().iter().cloned().collect()
    }

    pub fn failed_ids(&self) -> Vec<i64> {
        self.failed_records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect()
    }

    /// Point-in-time aggregate for the status feed. Never mutated by consumers.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            read: self.read_count(),
            compressed: self.compressed_count(),
            skipped: self.skipped_count(),
            updated: self.updated_count(),
            errors: self.error_count(),
            original_bytes: self.original_bytes(),
            compressed_bytes: self.compressed_bytes(),
            skipped_bytes: self.skipped_bytes.load(Ordering::Relaxed),
            total_records: self.total_records.load(Ordering::Relaxed),
            initial_db_size_bytes: self.initial_db_size_bytes.load(Ordering::Relaxed),
            final_db_size_bytes: self.final_db_size_bytes.load(Ordering::Relaxed),
            projected_final_bytes: self.projected_final_size_bytes(),
            compression_ratio: self.compression_ratio(),
            savings_percent: self.savings_percent(),
            progress_percent: self.progress_percent(),
            elapsed_seconds: self.elapsed().as_secs(),
            records_per_second: self.records_per_second(),
            mb_per_second: self.mb_per_second(),
            avg_processing_time_ms: self.average_processing_time_ms(),
            dead_letter_size: self.failed_records.lock().unwrap().len(),
            completed: self.is_completed(),
        }
    }
}

/// Immutable snapshot of progress metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub read: u64,
    pub compressed: u64,
    pub skipped: u64,
    pub updated: u64,
    pub errors: u64,
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub skipped_bytes: u64,
    pub total_records: u64,
    pub initial_db_size_bytes: u64,
    pub final_db_size_bytes: u64,
    pub projected_final_bytes: u64,
    pub compression_ratio: f64,
    pub savings_percent: f64,
    pub progress_percent: f64,
    pub elapsed_seconds: u64,
    pub records_per_second: f64,
    pub mb_per_second: f64,
    pub avg_processing_time_ms: u64,
    pub dead_letter_size: usize,
    pub completed: bool,
}

impl ProgressSnapshot {
    pub fn original_mb(&self) -> f64 {
        self.original_bytes as f64 / 1024.0 / 1024.0
    }

    pub fn compressed_mb(&self) -> f64 {
        self.compressed_bytes as f64 / 1024.0 / 1024.0
    }

    pub fn elapsed_formatted(&self) -> String {
        let h = self.elapsed_seconds / 3600;
        let m = (self.elapsed_seconds % 3600) / 60;
        let s = self.elapsed_seconds % 60;
        if h > 0 {
            format!("{}:{:02}:{:02}", h, m, s)
        } else {
            format!("{}:{:02}", m, s)
        }
    }
}
