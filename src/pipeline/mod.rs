//! Pipeline orchestration: bounded batch runs and the continuous watchdog.

pub mod pipeline;
pub mod task;
pub mod tracker;
pub mod watchdog;

pub use pipeline::CompressionPipeline;
pub use task::{PdfTask, ResultMessage, SuccessRow, WorkItem};
pub use tracker::{ActivityEntry, FailedRecord, ProgressSnapshot, ProgressTracker};
pub use watchdog::{CycleObserver, CycleSummary, WatchdogService, WatchdogStatus};
