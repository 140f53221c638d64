//! Per-node table of queue client connections currently open.
//!
//! Only the lifecycle layer writes here; the reconciler reads snapshots.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::descriptor::{ConnectionId, ConnectionKind};
use crate::lifecycle::NativeConnection;

/// Registry slot for one open connection.
pub(crate) struct LocalEntry {
    kind: ConnectionKind,
    opened_at: DateTime<Utc>,
    pub(crate) handle: Box<dyn NativeConnection>,
}

/// Public view of one open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Consumer or producer.
    pub kind: ConnectionKind,
    /// When the lifecycle manager registered it.
    pub opened_at: DateTime<Utc>,
}

/// Connections open on this node, keyed by id.
#[derive(Default)]
pub struct LocalConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, LocalEntry>>,
}

impl std::fmt::Debug for LocalConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnectionRegistry").finish_non_exhaustive()
    }
}

impl LocalConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of the open connection ids.
    pub async fn list_all(&self) -> BTreeSet<ConnectionId> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Point-in-time copy of every open connection, sorted by id.
    pub async fn snapshot(&self) -> Vec<OpenConnection> {
        let entries = self.entries.read().await;
        let mut out: Vec<OpenConnection> = entries
            .iter()
            .map(|(id, e)| OpenConnection {
                id: id.clone(),
                kind: e.kind,
                opened_at: e.opened_at,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Whether `id` is open on this node.
    pub async fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// Number of open connections.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is open.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Record a freshly opened connection. Returns a displaced handle if the
    /// id was already present.
    pub(crate) async fn insert(
        &self,
        id: ConnectionId,
        handle: Box<dyn NativeConnection>,
    ) -> Option<Box<dyn NativeConnection>> {
        let entry = LocalEntry {
            kind: id.kind(),
            opened_at: Utc::now(),
            handle,
        };
        self.entries
            .write()
            .await
            .insert(id, entry)
            .map(|old| old.handle)
    }

    /// Take a connection out for teardown.
    pub(crate) async fn remove(&self, id: &ConnectionId) -> Option<LocalEntry> {
        self.entries.write().await.remove(id)
    }

    /// Put back an entry whose teardown failed, keeping its open time.
    pub(crate) async fn restore(&self, id: ConnectionId, entry: LocalEntry) {
        self.entries.write().await.entry(id).or_insert(entry);
    }

    /// Remove everything, returning the handles for teardown.
    pub(crate) async fn drain(&self) -> Vec<(ConnectionId, Box<dyn NativeConnection>)> {
        self.entries
            .write()
            .await
            .drain()
            .map(|(id, e)| (id, e.handle))
            .collect()
    }
}
