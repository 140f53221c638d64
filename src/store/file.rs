//! Registry snapshot read from a JSON file.
//!
//! The file maps connection ids to descriptor records:
//!
//! ```json
//! { "consumer:f1:c1": { "topics": ["orders"], "groupId": "g1" },
//!   "producer:f1:c2": {} }
//! ```
//!
//! It is re-read on every call so changes made by an external writer are
//! picked up by the next lookup. Only the top level must be a JSON object;
//! values are handed back unvalidated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{ClusterStateStore, RegistryEntry, StoreError};

/// File-backed [`ClusterStateStore`].
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Read the registry from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "registry file absent, treating as empty");
                return Ok(BTreeMap::new());
            }
            Err(e) => {
                return Err(StoreError::Unreachable(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|e| {
            StoreError::Unreachable(format!("failed to parse {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl ClusterStateStore for FileStateStore {
    async fn enumerate_all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .map(|(key, value)| RegistryEntry { key, value })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.load().await?.remove(key))
    }
}
