//! Opening and tearing down queue client connections.
//!
//! [`ConnectionLifecycleManager`] is the seam the reconciler drives.
//! [`RegisteringLifecycle`] implements it over a [`QueueConnector`] (the
//! message-queue client library) and keeps the [`LocalConnectionRegistry`]
//! in step with what is actually open.
//!
//! [`LocalConnectionRegistry`]: crate::registry::LocalConnectionRegistry

use async_trait::async_trait;

use crate::descriptor::{ConnectionDescriptor, ConnectionId};

pub mod logging;
pub mod registering;

pub use logging::LoggingConnector;
pub use registering::RegisteringLifecycle;

/// Errors from opening or closing a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The queue client refused or failed to connect.
    #[error("failed to open {id}: {reason}")]
    Open {
        /// Connection identifier.
        id: String,
        /// Client-reported cause.
        reason: String,
    },
    /// The queue client failed to disconnect cleanly.
    #[error("failed to close {id}: {reason}")]
    Close {
        /// Connection identifier.
        id: String,
        /// Client-reported cause.
        reason: String,
    },
    /// Error raised inside the queue client library.
    #[error("queue client error: {0}")]
    Client(String),
}

/// Creates and destroys connections for descriptors.
#[async_trait]
pub trait ConnectionLifecycleManager: Send + Sync {
    /// Open the connection described by `descriptor`.
    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<(), ConnectionError>;

    /// Close a connection. Closing one that is not open succeeds.
    async fn close(&self, id: &ConnectionId) -> Result<(), ConnectionError>;
}

/// A live client connection owned by the registry.
#[async_trait]
pub trait NativeConnection: Send + Sync {
    /// Disconnect from the broker and release client resources.
    async fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

/// Message-queue client library seam: turns descriptors into live clients.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Connect a consumer or producer for `descriptor`.
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn NativeConnection>, ConnectionError>;
}
