//! In-process document backend

use std::future::Future;
use std::pin::Pin;

use tokio::sync::Mutex;

use crate::DocumentStore;
use crate::document::CodePool;
use crate::error::{Error, Result};

/// Keeps the document in memory. Same version semantics as the file store;
/// nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<CodePool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing document.
    pub fn with_document(pool: CodePool) -> Self {
        Self {
            document: Mutex::new(Some(pool)),
        }
    }
}

impl DocumentStore for MemoryStore {
    fn id(&self) -> &str {
        "memory"
    }

    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CodePool>>> + Send + '_>> {
        Box::pin(async move { Ok(self.document.lock().await.clone()) })
    }

    fn replace<'a>(
        &'a self,
        expected_version: u64,
        pool: &'a CodePool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut document = self.document.lock().await;
            let found = document.as_ref().map(|p| p.version).unwrap_or(0);
            if found != expected_version {
                return Err(Error::Conflict {
                    expected: expected_version,
                    found,
                });
            }
            *document = Some(pool.clone());
            Ok(())
        })
    }
}
