//! Lifecycle manager that records every open connection in the local registry.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::descriptor::{ConnectionDescriptor, ConnectionId};
use crate::registry::LocalConnectionRegistry;

use super::{ConnectionError, ConnectionLifecycleManager, QueueConnector};

/// [`ConnectionLifecycleManager`] backed by a [`QueueConnector`].
///
/// Sole writer of the [`LocalConnectionRegistry`]: an entry is added only
/// after the connector succeeds and stays removed only once the client has
/// disconnected.
pub struct RegisteringLifecycle<C> {
    connector: C,
    registry: Arc<LocalConnectionRegistry>,
}

impl<C: QueueConnector> RegisteringLifecycle<C> {
    /// Wrap `connector`, recording connections in `registry`.
    pub fn new(connector: C, registry: Arc<LocalConnectionRegistry>) -> Self {
        Self {
            connector,
            registry,
        }
    }

    /// Tear down every connection open on this node.
    ///
    /// Used on node shutdown. Failures are logged; every entry is removed
    /// from the registry regardless. Returns the number of connections
    /// that disconnected cleanly.
    pub async fn close_all(&self) -> usize {
        let drained = self.registry.drain().await;
        let total = drained.len();
        let mut clean: usize = 0;
        for (id, mut handle) in drained {
            match handle.disconnect().await {
                Ok(()) => clean = clean.saturating_add(1),
                Err(e) => warn!(connection_id = %id, error = %e, "disconnect on shutdown failed"),
            }
        }
        info!(total, clean, "local connections closed");
        clean
    }
}

#[async_trait]
impl<C: QueueConnector> ConnectionLifecycleManager for RegisteringLifecycle<C> {
    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<(), ConnectionError> {
        let id = descriptor.id();
        if self.registry.contains(id).await {
            debug!(connection_id = %id, "already open, nothing to do");
            return Ok(());
        }

        let handle = self
            .connector
            .connect(descriptor)
            .await
            .map_err(|e| ConnectionError::Open {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(mut displaced) = self.registry.insert(id.clone(), handle).await {
            warn!(connection_id = %id, "connection opened twice, dropping the older client");
            if let Err(e) = displaced.disconnect().await {
                warn!(connection_id = %id, error = %e, "failed to disconnect displaced client");
            }
        }
        info!(connection_id = %id, kind = %descriptor.kind(), "connection opened");
        Ok(())
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), ConnectionError> {
        let Some(mut entry) = self.registry.remove(id).await else {
            debug!(connection_id = %id, "not open, nothing to close");
            return Ok(());
        };
        if let Err(e) = entry.handle.disconnect().await {
            // Still open as far as the reconciler can tell; retried next pass.
            self.registry.restore(id.clone(), entry).await;
            return Err(ConnectionError::Close {
                id: id.to_string(),
                reason: e.to_string(),
            });
        }
        info!(connection_id = %id, "connection closed");
        Ok(())
    }
}
