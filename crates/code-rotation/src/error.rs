//! Error types for code rotation

/// Errors surfaced at the rotation engine boundary.
///
/// None of these are retried internally; callers decide what to show.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("code store unavailable: {0}")]
    StoreUnavailable(#[from] code_store::Error),

    #[error("no codes available for page {0}")]
    PoolExhausted(code_store::PageId),

    #[error("unknown page: {0}")]
    UnknownPage(u32),
}

/// Result alias for rotation operations.
pub type Result<T> = std::result::Result<T, Error>;
