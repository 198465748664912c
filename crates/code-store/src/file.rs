//! JSON file backend for the pool document
//!
//! The document is re-read from disk on every `load`, so an external
//! provisioning tool can edit the file between requests. All writes use
//! atomic temp-file + rename to prevent corruption on crash. A tokio Mutex
//! serializes writers inside this process; the version check catches writers
//! in other processes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::DocumentStore;
use crate::document::CodePool;
use crate::error::{Error, Result};

/// Pool document persisted as a single JSON file.
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open a store at `path`.
    ///
    /// The parent directory must exist. A missing file is fine: it loads as
    /// `None` until the first replace creates it.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|e| Error::Io(format!("store directory {}: {e}", dir.display())))?;
        if !meta.is_dir() {
            return Err(Error::Io(format!("{} is not a directory", dir.display())));
        }
        info!(path = %path.display(), exists = path.exists(), "opened code store");
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentStore for JsonFileStore {
    fn id(&self) -> &str {
        "json-file"
    }

    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Option<CodePool>>> + Send + '_>> {
        Box::pin(read_document(&self.path))
    }

    fn replace<'a>(
        &'a self,
        expected_version: u64,
        pool: &'a CodePool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let found = read_document(&self.path)
                .await?
                .map(|p| p.version)
                .unwrap_or(0);
            if found != expected_version {
                return Err(Error::Conflict {
                    expected: expected_version,
                    found,
                });
            }
            write_atomic(&self.path, pool).await
        })
    }
}

async fn read_document(path: &Path) -> Result<Option<CodePool>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading code file: {e}"))),
    };
    let pool = serde_json::from_str(&contents)
        .map_err(|e| Error::Parse(format!("parsing code file: {e}")))?;
    Ok(Some(pool))
}

/// Write the document to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file holds every live access code.
async fn write_atomic(path: &Path, pool: &CodePool) -> Result<()> {
    let json = serde_json::to_string_pretty(pool)
        .map_err(|e| Error::Parse(format!("serializing code pool: {e}")))?;

    let dir = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let tmp_path = dir.join(format!(".codes.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp code file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting code file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp code file: {e}")))?;

    debug!(path = %path.display(), version = pool.version, "persisted code pool");
    Ok(())
}
