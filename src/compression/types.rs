//! Type definitions for the compression capability.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Compression quality modes with predefined settings.
///
/// Each mode fixes an image scale factor and a quality factor that a
/// [`Compressor`](super::Compressor) implementation may interpret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// No quality loss, structural re-encoding only.
    Lossless,

    /// Balanced compression with minimal quality loss.
    Medium,

    /// Maximum compression, noticeable quality reduction.
    Aggressive,
}

impl CompressionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::Lossless => "lossless",
            CompressionMode::Medium => "medium",
            CompressionMode::Aggressive => "aggressive",
        }
    }

    pub fn scale_factor(&self) -> f32 {
        match self {
            CompressionMode::Lossless => 1.0,
            CompressionMode::Medium => 0.75,
            CompressionMode::Aggressive => 0.5,
        }
    }

    pub fn quality_factor(&self) -> f32 {
        match self {
            CompressionMode::Lossless => 1.0,
            CompressionMode::Medium => 0.7,
            CompressionMode::Aggressive => 0.3,
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, CompressionMode::Lossless)
    }
}

impl FromStr for CompressionMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lossless" => Ok(CompressionMode::Lossless),
            "medium" => Ok(CompressionMode::Medium),
            "aggressive" => Ok(CompressionMode::Aggressive),
            _ => Err(DomainError::Configuration(format!(
                "Invalid compression mode: {}",
                s
            ))),
        }
    }
}

/// Result of attempting to compress one source row. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompressionOutcome {
    Success {
        id: i64,
        secondary_id: i64,
        filename: String,
        compressed: Vec<u8>,
        original_size: i64,
        compressed_size: i64,
        duration: Duration,
    },
    Skipped {
        id: i64,
        secondary_id: i64,
        filename: String,
        size: i64,
        reason: String,
    },
    Failure {
        id: i64,
        secondary_id: i64,
        filename: String,
        message: String,
    },
}

impl CompressionOutcome {
    pub fn id(&self) -> i64 {
        match self {
            CompressionOutcome::Success { id, .. }
            | CompressionOutcome::Skipped { id, .. }
            | CompressionOutcome::Failure { id, .. } => *id,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            CompressionOutcome::Success { filename, .. }
            | CompressionOutcome::Skipped { filename, .. }
            | CompressionOutcome::Failure { filename, .. } => filename,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompressionOutcome::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, CompressionOutcome::Skipped { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CompressionOutcome::Failure { .. })
    }

    /// `compressed / original`, defined as 1.0 for an empty original.
    pub fn compression_ratio(&self) -> f64 {
        match self {
            CompressionOutcome::Success {
                original_size,
                compressed_size,
                ..
            } if *original_size > 0 => *compressed_size as f64 / *original_size as f64,
            _ => 1.0,
        }
    }

    pub fn savings_percent(&self) -> f64 {
        (1.0 - self.compression_ratio()) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [
            CompressionMode::Lossless,
            CompressionMode::Medium,
            CompressionMode::Aggressive,
        ] {
            assert_eq!(mode.as_str().parse::<CompressionMode>().unwrap(), mode);
        }
        assert!("turbo".parse::<CompressionMode>().is_err());
    }

    #[test]
    fn ratio_is_one_for_empty_original() {
        let outcome = CompressionOutcome::Success {
            id: 1,
            secondary_id: 1,
            filename: "a.pdf".to_string(),
            compressed: vec![],
            original_size: 0,
            compressed_size: 0,
            duration: Duration::ZERO,
        };
        assert_eq!(outcome.compression_ratio(), 1.0);
        assert_eq!(outcome.savings_percent(), 0.0);
    }

    #[test]
    fn accessors_cover_every_variant() {
        let failure = CompressionOutcome::Failure {
            id: 9,
            secondary_id: 2,
            filename: "f.pdf".to_string(),
            message: "deflate write error".to_string(),
        };
        assert_eq!(failure.id(), 9);
        assert_eq!(failure.filename(), "f.pdf");
        assert!(failure.is_failure());
        assert!(!failure.is_success());

        let skipped = CompressionOutcome::Skipped {
            id: 3,
            secondary_id: 1,
            filename: "s.bin".to_string(),
            size: 10,
            reason: "Not a PDF file".to_string(),
        };
        assert_eq!(skipped.id(), 3);
        assert!(skipped.is_skipped());
        assert!(!skipped.is_failure());
    }

    #[test]
    fn savings_reflect_size_reduction() {
        let outcome = CompressionOutcome::Success {
            id: 1,
            secondary_id: 1,
            filename: "a.pdf".to_string(),
            compressed: vec![0; 25],
            original_size: 100,
            compressed_size: 25,
            duration: Duration::ZERO,
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.compression_ratio(), 0.25);
        assert_eq!(outcome.savings_percent(), 75.0);
    }
}
