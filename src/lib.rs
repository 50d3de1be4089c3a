//! Database-resident PDF compression.
//!
//! Streams PDF payloads out of a master/detail table pair, compresses them
//! through a bounded producer/worker/writer pipeline, and writes the
//! results back in place. A tracking table makes every run idempotent:
//! rows already processed (successfully, skipped, or failed) are excluded
//! from re-enumeration.
//!
//! Two execution modes are provided:
//! - [`CompressionPipeline`] runs once over a configured id range and exits.
//! - [`WatchdogService`] polls for rows beyond a moving high-water mark and
//!   compresses new arrivals as they appear.

pub mod compression;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod store;

pub use compression::{CompressionMode, CompressionOutcome, Compressor, DeflateCompressor};
pub use config::SquishConfig;
pub use errors::{DbError, DomainError, DomainResult};
pub use pipeline::{
    CompressionPipeline, CycleObserver, CycleSummary, ProgressSnapshot, ProgressTracker,
    WatchdogService, WatchdogStatus,
};
pub use store::{
    PayloadWriter, SourceRecord, SourceRepository, TrackingRecord, TrackingRepository,
    TrackingStatus,
};
