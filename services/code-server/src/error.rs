//! Service lifecycle errors
//!
//! Per-request failures (exhausted pool, unknown page, store unavailable) are
//! mapped straight to HTTP responses by the handlers and never surface here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Retryable: directory missing, permissions, transient I/O
    #[error("code store could not be opened: {0}")]
    StoreOpen(String),

    /// Not retryable: the document exists but cannot be parsed
    #[error("code store document is corrupt: {0}")]
    StoreCorrupt(String),
}

impl From<code_store::Error> for Error {
    fn from(e: code_store::Error) -> Self {
        match e {
            code_store::Error::Parse(msg) => Error::StoreCorrupt(msg),
            other => Error::StoreOpen(other.to_string()),
        }
    }
}

impl From<code_rotation::Error> for Error {
    fn from(e: code_rotation::Error) -> Self {
        match e {
            code_rotation::Error::StoreUnavailable(inner) => inner.into(),
            other => Error::StoreOpen(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
