//! Compression capability: outcome types and the pluggable compressor boundary.
pub mod compressor;
pub mod types;

pub use compressor::{Compressor, DeflateCompressor, PDF_MAGIC};
pub use types::{CompressionMode, CompressionOutcome};
