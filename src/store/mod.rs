//! Read access to the cluster-wide desired-state registry.
//!
//! The registry is written by flow lifecycle management on any node. This
//! crate only reads it: enumerate everything, or look one key up.

use async_trait::async_trait;

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

/// Errors surfaced by a state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or read.
    #[error("state store unreachable: {0}")]
    Unreachable(String),
}

/// One `{key, value}` pair of the cluster registry.
///
/// The value is kept raw; validation happens per entry in the reconciler so
/// one malformed record cannot hide the rest of the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    /// Connection identifier the value is stored under.
    pub key: String,
    /// Registered descriptor record, unvalidated.
    pub value: serde_json::Value,
}

/// Cluster-visible key-value registry of desired connections.
#[async_trait]
pub trait ClusterStateStore: Send + Sync {
    /// Enumerate every registered connection.
    async fn enumerate_all(&self) -> Result<Vec<RegistryEntry>, StoreError>;

    /// Look up one key. `Ok(None)` means it is not registered.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
}
