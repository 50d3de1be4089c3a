//! The pluggable compression capability.

use std::io::Write;
use std::time::Instant;

use async_trait::async_trait;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::task;

use super::types::{CompressionMode, CompressionOutcome};
use crate::errors::{DomainError, DomainResult};

/// PDF magic bytes: `%PDF-`
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// A compression capability invoked by the worker pool.
///
/// Implementations must perform their own structural-validity check and
/// report structurally invalid payloads as `Skipped`, never `Failure`.
#[async_trait]
pub trait Compressor: Send + Sync {
    async fn compress(
        &self,
        id: i64,
        secondary_id: i64,
        filename: &str,
        data: Vec<u8>,
        mode: CompressionMode,
    ) -> CompressionOutcome;
}

/// Default capability: validates the PDF header, then re-encodes the payload
/// with zlib. The mode maps onto the deflate level; real image downsampling
/// belongs to an external implementation of [`Compressor`].
pub struct DeflateCompressor;

impl DeflateCompressor {
    fn level(mode: CompressionMode) -> Compression {
        match mode {
            CompressionMode::Lossless => Compression::new(6),
            CompressionMode::Medium => Compression::new(7),
            CompressionMode::Aggressive => Compression::best(),
        }
    }

    fn deflate(data: &[u8], level: Compression) -> DomainResult<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), level);
        encoder
            .write_all(data)
            .map_err(|e| DomainError::Compression(format!("deflate write error: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| DomainError::Compression(format!("deflate finish error: {}", e)))
    }
}

pub fn is_pdf(data: &[u8]) -> bool {
    data.len() >= PDF_MAGIC.len() && data[..PDF_MAGIC.len()] == *PDF_MAGIC
}

#[async_trait]
impl Compressor for DeflateCompressor {
    async fn compress(
        &self,
        id: i64,
        secondary_id: i64,
        filename: &str,
        data: Vec<u8>,
        mode: CompressionMode,
    ) -> CompressionOutcome {
        let original_size = data.len() as i64;

        if !is_pdf(&data) {
            log::debug!(
                "Skipped id={} ({}): not a PDF file ({} bytes)",
                id,
                filename,
                original_size
            );
            return CompressionOutcome::Skipped {
                id,
                secondary_id,
                filename: filename.to_string(),
                size: original_size,
                reason: "Not a PDF file".to_string(),
            };
        }

        let started = Instant::now();
        let level = Self::level(mode);

        let result = task::spawn_blocking(move || Self::deflate(&data, level))
            .await
            .map_err(|e| DomainError::Internal(format!("Task join error: {}", e)))
            .and_then(|r| r);

        match result {
            Ok(compressed) => {
                let duration = started.elapsed();
                let compressed_size = compressed.len() as i64;
                log::debug!(
                    "Compressed id={} ({}) in {}ms: {} -> {} bytes",
                    id,
                    filename,
                    duration.as_millis(),
                    original_size,
                    compressed_size
                );
                CompressionOutcome::Success {
                    id,
                    secondary_id,
                    filename: filename.to_string(),
                    compressed,
                    original_size,
                    compressed_size,
                    duration,
                }
            }
            Err(e) => {
                log::warn!("Failed to compress id={} ({}): {}", id, filename, e);
                CompressionOutcome::Failure {
                    id,
                    secondary_id,
                    filename: filename.to_string(),
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf_payload(body: &[u8]) -> Vec<u8> {
        let mut data = PDF_MAGIC.to_vec();
        data.extend_from_slice(b"1.4\n");
        data.extend_from_slice(body);
        data
    }

    #[tokio::test]
    async fn valid_header_compresses() {
        let data = pdf_payload(&vec![b'x'; 4096]);
        let outcome = DeflateCompressor
            .compress(1, 1, "a.pdf", data, CompressionMode::Medium)
            .await;
        match outcome {
            CompressionOutcome::Success {
                original_size,
                compressed_size,
                ..
            } => {
                assert_eq!(original_size, 4096 + 9);
                assert!(compressed_size < original_size);
            }
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_header_is_always_skipped() {
        // Arbitrary trailing content must not turn a skip into a failure.
        for body in [&b""[..], &b"%PDX-1.4 garbage"[..], &[0xff; 64][..]] {
            let outcome = DeflateCompressor
                .compress(2, 2, "b.bin", body.to_vec(), CompressionMode::Aggressive)
                .await;
            assert!(outcome.is_skipped(), "expected skip for {:?}", body);
        }
    }

    #[tokio::test]
    async fn truncated_magic_is_skipped() {
        let outcome = DeflateCompressor
            .compress(3, 3, "c.pdf", b"%PD".to_vec(), CompressionMode::Lossless)
            .await;
        assert!(outcome.is_skipped());
    }
}
