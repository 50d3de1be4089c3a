//! Durable storage: source/detail tables, tracking ledger, batched writes.

pub mod source;
pub mod tracking;
pub mod writer;

pub use source::{SourceRecord, SourceRepository, SqliteSourceRepository};
pub use tracking::{
    SqliteTrackingRepository, TrackingRecord, TrackingRepository, TrackingStatus,
};
pub use writer::{DryRunPayloadWriter, PayloadWriter, SqlitePayloadWriter};

/// Strip anything that is not alphanumeric or underscore from an identifier
/// before it is interpolated into SQL. Table and column names come from
/// configuration, never from row data; the operator filter fragment is the
/// one deliberate exception and is documented as trusted.
pub(crate) fn sanitize_identifier(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    if cleaned.is_empty() {
        return "_invalid".to_string();
    }
    if cleaned.chars().next().map(|c| c.is_ascii_digit()) == Some(true) {
        return format!("_{}", cleaned);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("squish_processed"), "squish_processed");
        assert_eq!(sanitize_identifier("DROP TABLE x;"), "DROPTABLEx");
        assert_eq!(sanitize_identifier("123col"), "_123col");
        assert_eq!(sanitize_identifier(""), "_invalid");
        assert_eq!(sanitize_identifier("!@#"), "_invalid");
    }
}
