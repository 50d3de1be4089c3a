//! Watchdog cycle semantics: high-water mark movement, idempotent re-polls,
//! observer notification, and lifecycle transitions.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use pdf_squish::config::SquishConfig;
use pdf_squish::pipeline::{CycleObserver, CycleSummary, ProgressTracker, WatchdogService};
use pdf_squish::store::SqliteTrackingRepository;

async fn setup_pool(dir: &TempDir) -> SqlitePool {
    let path = dir.path().join("watchdog.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE documents (doc_id INTEGER PRIMARY KEY, file_name TEXT NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE document_data (
            doc_id INTEGER NOT NULL,
            revision INTEGER NOT NULL,
            data BLOB,
            PRIMARY KEY (doc_id, revision)
        )",
    )
    .execute(&pool)
    .await
    .unwrap();
    SqliteTrackingRepository::ensure_schema(&pool, "squish_processed")
        .await
        .unwrap();
    pool
}

async fn insert_pdf(pool: &SqlitePool, id: i64) {
    let mut payload = b"%PDF-1.4\n".to_vec();
    payload.resize(1024, b'a');
    sqlx::query("INSERT INTO documents (doc_id, file_name) VALUES (?, ?)")
        .bind(id)
        .bind(format!("{}.pdf", id))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO document_data (doc_id, revision, data) VALUES (?, ?, ?)")
        .bind(id)
        .bind(1i64)
        .bind(payload)
        .execute(pool)
        .await
        .unwrap();
}

fn test_config() -> SquishConfig {
    let mut config = SquishConfig::default();
    config.pipeline.worker_count = 2;
    config.watchdog.poll_interval_secs = 3600;
    config.watchdog.shutdown_grace_secs = 5;
    config
}

#[derive(Default)]
struct RecordingObserver {
    summaries: Mutex<Vec<CycleSummary>>,
}

#[async_trait]
impl CycleObserver for RecordingObserver {
    async fn cycle_finished(&self, summary: &CycleSummary) {
        self.summaries.lock().unwrap().push(summary.clone());
    }
}

#[tokio::test]
async fn watermark_advances_and_late_low_ids_are_ignored() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    insert_pdf(&pool, 100).await;

    let tracker = Arc::new(ProgressTracker::new());
    let observer = Arc::new(RecordingObserver::default());
    let watchdog = WatchdogService::from_pool(pool.clone(), test_config(), tracker.clone())
        .with_observer(observer.clone());

    // No cycle has completed yet, so there is no countdown.
    assert_eq!(watchdog.status().next_cycle_in_secs, None);

    assert_eq!(watchdog.run_cycle().await, 1);
    assert_eq!(watchdog.status().last_processed_id, 100);

    // The countdown runs from the end of the last cycle.
    let remaining = watchdog.status().next_cycle_in_secs.unwrap();
    assert!(remaining > 0 && remaining <= 3600);

    insert_pdf(&pool, 101).await;
    insert_pdf(&pool, 103).await;
    assert_eq!(watchdog.run_cycle().await, 2);
    assert_eq!(watchdog.status().last_processed_id, 103);

    // Nothing new: the marked rows themselves must not be revisited.
    assert_eq!(watchdog.run_cycle().await, 0);

    // An id arriving below the watermark is invisible to the poll.
    insert_pdf(&pool, 102).await;
    assert_eq!(watchdog.run_cycle().await, 0);

    insert_pdf(&pool, 104).await;
    assert_eq!(watchdog.run_cycle().await, 1);
    assert_eq!(watchdog.status().last_processed_id, 104);

    assert_eq!(tracker.read_count(), 4);
    assert_eq!(tracker.compressed_count(), 4);
    assert_eq!(tracker.updated_count(), 4);

    // Only cycles that processed records produced a report.
    let summaries = observer.summaries.lock().unwrap();
    let records: Vec<u64> = summaries.iter().map(|s| s.records).collect();
    assert_eq!(records, vec![1, 2, 1]);
    assert!(summaries.iter().all(|s| s.compressed_bytes < s.original_bytes));
}

#[tokio::test]
async fn cycle_results_are_persisted_and_tracked() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    insert_pdf(&pool, 7).await;

    let tracker = Arc::new(ProgressTracker::new());
    let watchdog = WatchdogService::from_pool(pool.clone(), test_config(), tracker);
    assert_eq!(watchdog.run_cycle().await, 1);

    let stored: Vec<u8> = sqlx::query("SELECT data FROM document_data WHERE doc_id = 7")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("data");
    assert!(stored.len() < 1024);

    let status: String = sqlx::query("SELECT status FROM squish_processed WHERE doc_id = 7")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("status");
    assert_eq!(status, "SUCCESS");
}

#[tokio::test]
async fn start_and_close_drive_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    insert_pdf(&pool, 1).await;

    let tracker = Arc::new(ProgressTracker::new());
    let watchdog = Arc::new(WatchdogService::from_pool(
        pool.clone(),
        test_config(),
        tracker.clone(),
    ));

    watchdog.clone().start().await;
    assert!(watchdog.status().running);
    // Double start is a no-op.
    watchdog.clone().start().await;

    watchdog.close().await;
    let status = watchdog.status();
    assert!(!status.running);
    assert!(status.cycle_count >= 1);
    assert!(tracker.is_completed());
    // Shutdown releases the store connections.
    assert!(pool.is_closed());

    // Closing again is harmless.
    watchdog.close().await;
}
