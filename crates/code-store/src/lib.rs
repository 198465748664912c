//! Durable storage for the rotating access-code pool
//!
//! The whole pool lives in a single document (`CodePool`) that is read and
//! replaced as a unit. Writers carry the version they read; a replace against
//! a document that moved on in the meantime is rejected with `Conflict`, so
//! two processes sharing one file cannot silently overwrite each other.
//!
//! Backends:
//! - `JsonFileStore`: one pretty-printed JSON file, atomic temp-file + rename
//! - `MemoryStore`: in-process document for tests and throwaway deployments

pub mod document;
pub mod error;
pub mod file;
pub mod memory;

pub use document::{ActiveAssignment, CodePool, PageId, PoolStats, UsedCode};
pub use error::{Error, Result};
pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::future::Future;
use std::pin::Pin;

/// Whole-document storage for the code pool.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn DocumentStore>`).
pub trait DocumentStore: Send + Sync {
    /// Backend name for logging and health reporting (e.g. "json-file", "memory")
    fn id(&self) -> &str;

    /// Read the whole document. `None` means it has never been created.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CodePool>>> + Send + '_>>;

    /// Replace the whole document.
    ///
    /// `expected_version` is the version the caller read (0 when the document
    /// did not exist). The write is refused with `Error::Conflict` when the
    /// stored version differs. Callers stamp `pool.version` with
    /// `expected_version + 1` before calling.
    fn replace<'a>(
        &'a self,
        expected_version: u64,
        pool: &'a CodePool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
