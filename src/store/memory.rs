//! In-process registry, used by tests and by applications that embed the
//! write side in the same process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::descriptor::ConnectionDescriptor;

use super::{ClusterStateStore, RegistryEntry, StoreError};

/// In-memory [`ClusterStateStore`].
///
/// Cloning shares the underlying map, so a clone handed to the reconciler
/// observes later `register`/`deregister` calls.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    entries: Arc<RwLock<BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validated descriptor under its derived id.
    pub async fn register(&self, descriptor: &ConnectionDescriptor) {
        self.insert_raw(descriptor.id().to_string(), descriptor.to_record().to_value())
            .await;
    }

    /// Store an arbitrary value under an arbitrary key, bypassing validation.
    pub async fn insert_raw(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.write().await.insert(key.into(), value);
    }

    /// Remove a key. Returns whether it was present.
    pub async fn deregister(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }

    /// Number of registered entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ClusterStateStore for MemoryStateStore {
    async fn enumerate_all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .map(|(key, value)| RegistryEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }
}
