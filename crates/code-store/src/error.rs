//! Error types for document storage

/// Errors from reading or replacing the pool document.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("document parse error: {0}")]
    Parse(String),

    #[error("version conflict: expected {expected}, found {found}")]
    Conflict { expected: u64, found: u64 },
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
