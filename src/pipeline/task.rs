//! Queue message types for the pipeline stages.

/// One source row to be compressed.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: i64,
    pub secondary_id: i64,
    pub filename: String,
    pub payload: Vec<u8>,
}

/// Intake-queue message. Each worker consumes exactly one `Sentinel`.
#[derive(Debug)]
pub enum PdfTask {
    Item(WorkItem),
    Sentinel,
}

/// A successful compression ready to be persisted.
#[derive(Debug, Clone)]
pub struct SuccessRow {
    pub id: i64,
    pub secondary_id: i64,
    pub filename: String,
    pub compressed: Vec<u8>,
    pub original_size: i64,
    pub compressed_size: i64,
}

impl SuccessRow {
    pub fn savings_percent(&self) -> f64 {
        if self.original_size > 0 {
            100.0 * (1.0 - self.compressed_size as f64 / self.original_size as f64)
        } else {
            0.0
        }
    }
}

/// Result-queue message. Each writer consumes exactly one `Sentinel`.
#[derive(Debug)]
pub enum ResultMessage {
    Item(SuccessRow),
    Sentinel,
}
