//! Directory-backed code store.
//!
//! Module code lives in one file per content identifier, named by the
//! identifier's canonical text. Identifiers are validated base58 before they
//! get here, so the name can never escape the store directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{CodeStore, HostError};
use crate::identifier::Identifier;

/// Code store reading `<root>/<identifier>`.
#[derive(Debug, Clone)]
pub struct DirectoryCodeStore {
    root: PathBuf,
}

impl DirectoryCodeStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, HostError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            HostError::Io(format!(
                "failed to create store directory {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    /// Path the code for `id` is read from.
    pub fn path_for(&self, id: &Identifier) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Write code for `id` into the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn put(&self, id: &Identifier, code: &[u8]) -> Result<(), HostError> {
        let path = self.path_for(id);
        tokio::fs::write(&path, code)
            .await
            .map_err(|e| HostError::Io(format!("failed to write {}: {e}", path.display())))
    }
}

#[async_trait]
impl CodeStore for DirectoryCodeStore {
    async fn fetch_code(&self, id: &Identifier) -> Result<Vec<u8>, HostError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(code) => {
                debug!(module = %id, bytes = code.len(), "code fetched from store");
                Ok(code)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HostError::NotFound(id.to_string()))
            }
            Err(e) => Err(HostError::Io(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }
}
