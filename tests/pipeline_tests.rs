//! End-to-end tests for the bounded batch pipeline against a real sqlite
//! database on disk.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;

use pdf_squish::config::SquishConfig;
use pdf_squish::pipeline::{CompressionPipeline, ProgressTracker};
use pdf_squish::store::{SqliteTrackingRepository, TrackingRepository};

async fn setup_pool(dir: &TempDir) -> SqlitePool {
    let path = dir.path().join("squish.db");
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

async fn insert_doc(pool: &SqlitePool, id: i64, revision: i64, name: &str, data: &[u8]) {
    sqlx::query("INSERT INTO documents (doc_id, file_name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO document_data (doc_id, revision, data) VALUES (?, ?, ?)")
        .bind(id)
        .bind(revision)
        .bind(data)
        .execute(pool)
        .await
        .unwrap();
}

/// A well-formed, highly compressible PDF payload.
fn pdf_payload(len: usize) -> Vec<u8> {
    let mut data = b"%PDF-1.4\n".to_vec();
    data.resize(len, b'a');
    data
}

/// A payload without the PDF magic bytes.
fn gif_payload(len: usize) -> Vec<u8> {
    let mut data = b"GIF89a".to_vec();
    data.resize(len, b'b');
    data
}

fn test_config() -> SquishConfig {
    let mut config = SquishConfig::default();
    config.pipeline.worker_count = 1;
    config.pipeline.writer_count = 1;
    config.pipeline.queue_capacity = 2;
    config.pipeline.batch_size = 10;
    config
}

async fn tracking_row(pool: &SqlitePool, id: i64) -> Option<(String, Option<i64>)> {
    sqlx::query("SELECT status, compressed_size FROM squish_processed WHERE doc_id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .unwrap()
        .map(|row| (row.get("status"), row.get("compressed_size")))
}

async fn payload_of(pool: &SqlitePool, id: i64) -> Vec<u8> {
    sqlx::query("SELECT data FROM document_data WHERE doc_id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("data")
}

#[tokio::test]
async fn mixed_batch_compresses_pdfs_and_skips_the_rest() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    insert_doc(&pool, 1, 1, "a.pdf", &pdf_payload(4096)).await;
    insert_doc(&pool, 2, 1, "b.pdf", &gif_payload(4096)).await;
    insert_doc(&pool, 3, 1, "c.pdf", &pdf_payload(4096)).await;

    let tracker = Arc::new(ProgressTracker::new());
    let pipeline = CompressionPipeline::from_pool(pool.clone(), test_config(), tracker.clone());
    pipeline.calculate_initial_stats().await;
    assert_eq!(tracker.snapshot().total_records, 3);
    pipeline.run().await.unwrap();
    pipeline.calculate_final_stats().await;
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.initial_db_size_bytes, 3 * 4096);
    assert!(snapshot.final_db_size_bytes < snapshot.initial_db_size_bytes);

    assert_eq!(tracker.read_count(), 3);
    assert_eq!(tracker.compressed_count(), 2);
    assert_eq!(tracker.skipped_count(), 1);
    assert_eq!(tracker.updated_count(), 2);
    assert_eq!(tracker.error_count(), 0);
    assert!(tracker.is_completed());

    // PDFs were rewritten in place, smaller than before.
    for id in [1, 3] {
        let stored = payload_of(&pool, id).await;
        assert_ne!(stored, pdf_payload(4096));
        assert!(stored.len() < 4096);
        let (status, compressed_size) = tracking_row(&pool, id).await.unwrap();
        assert_eq!(status, "SUCCESS");
        assert_eq!(compressed_size, Some(stored.len() as i64));
    }

    // The non-PDF is untouched but tracked as skipped.
    assert_eq!(payload_of(&pool, 2).await, gif_payload(4096));
    let (status, compressed_size) = tracking_row(&pool, 2).await.unwrap();
    assert_eq!(status, "SKIPPED");
    assert_eq!(compressed_size, None);
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    insert_doc(&pool, 1, 1, "a.pdf", &pdf_payload(2048)).await;
    insert_doc(&pool, 2, 1, "b.pdf", &gif_payload(2048)).await;

    let first = Arc::new(ProgressTracker::new());
    CompressionPipeline::from_pool(pool.clone(), test_config(), first.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(first.read_count(), 2);

    let ledger = SqliteTrackingRepository::new(pool.clone(), "squish_processed");
    assert!(ledger.exists(1).await.unwrap());
    assert!(ledger.exists(2).await.unwrap());
    assert!(!ledger.exists(99).await.unwrap());

    // Every row is tracked now, so a second run sees nothing.
    let second = Arc::new(ProgressTracker::new());
    CompressionPipeline::from_pool(pool.clone(), test_config(), second.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(second.read_count(), 0);
    assert_eq!(second.updated_count(), 0);
}

#[tokio::test]
async fn empty_source_terminates_with_full_pools() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;

    let mut config = test_config();
    config.pipeline.worker_count = 3;
    config.pipeline.writer_count = 2;

    let tracker = Arc::new(ProgressTracker::new());
    let pipeline = CompressionPipeline::from_pool(pool, config, tracker.clone());
    // Sentinel accounting must shut down every worker and writer.
    tokio::time::timeout(std::time::Duration::from_secs(10), pipeline.run())
        .await
        .expect("pipeline did not terminate")
        .unwrap();
    assert_eq!(tracker.read_count(), 0);
    assert!(tracker.is_completed());
}

#[tokio::test]
async fn upper_bound_limits_the_range() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    for id in 1..=10 {
        insert_doc(&pool, id, 1, &format!("{}.pdf", id), &pdf_payload(1024)).await;
    }

    let mut config = test_config();
    config.pipeline.id_from = 2;
    config.pipeline.id_to = 5;

    let tracker = Arc::new(ProgressTracker::new());
    CompressionPipeline::from_pool(pool.clone(), config, tracker.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(tracker.read_count(), 4);
    assert!(tracking_row(&pool, 1).await.is_none());
    assert!(tracking_row(&pool, 2).await.is_some());
    assert!(tracking_row(&pool, 5).await.is_some());
    assert!(tracking_row(&pool, 6).await.is_none());
}

#[tokio::test]
async fn dry_run_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let pool = setup_pool(&dir).await;
    insert_doc(&pool, 1, 1, "a.pdf", &pdf_payload(2048)).await;
    insert_doc(&pool, 2, 1, "b.pdf", &gif_payload(2048)).await;

    let mut config = test_config();
    config.dry_run = true;

    let tracker = Arc::new(ProgressTracker::new());
    CompressionPipeline::from_pool(pool.clone(), config, tracker.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(tracker.read_count(), 2);
    assert_eq!(tracker.compressed_count(), 1);
    assert_eq!(tracker.skipped_count(), 1);

    assert_eq!(payload_of(&pool, 1).await, pdf_payload(2048));
    assert!(tracking_row(&pool, 1).await.is_none());
    assert!(tracking_row(&pool, 2).await.is_none());

    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM squish_processed")
        .fetch_one(&pool)
        .await
        .unwrap()
        .get("n");
    assert_eq!(count, 0);
}
