use thiserror::Error;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Error executing statement: {0}")]
    Execution(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::ConnectionPool(s) => DbError::ConnectionPool(s.clone()),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::Execution(s) => DbError::Execution(s.clone()),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
