mod error;

pub use error::{DbError, DomainError};

/// Result type used by all fallible operations in this crate.
pub type DomainResult<T> = Result<T, DomainError>;
