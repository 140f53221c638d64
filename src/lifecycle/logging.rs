//! Connector that opens no broker sockets and only logs.
//!
//! Used by the binary when no queue client library is linked in, so the
//! reconciler can run against a real registry in dry-run form.

use async_trait::async_trait;
use tracing::info;

use crate::descriptor::{ConnectionDescriptor, ConnectionId, ConnectionSpec};

use super::{ConnectionError, NativeConnection, QueueConnector};

/// [`QueueConnector`] that logs connects and disconnects.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingConnector;

struct LoggedConnection {
    id: ConnectionId,
}

#[async_trait]
impl NativeConnection for LoggedConnection {
    async fn disconnect(&mut self) -> Result<(), ConnectionError> {
        info!(connection_id = %self.id, "dry-run disconnect");
        Ok(())
    }
}

#[async_trait]
impl QueueConnector for LoggingConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Box<dyn NativeConnection>, ConnectionError> {
        match &descriptor.spec {
            ConnectionSpec::Consumer {
                topics,
                group_id,
                from_beginning,
            } => info!(
                connection_id = %descriptor.id(),
                ?topics,
                group_id = %group_id,
                from_beginning,
                "dry-run consumer connect"
            ),
            ConnectionSpec::Producer => {
                info!(connection_id = %descriptor.id(), "dry-run producer connect");
            }
        }
        Ok(Box::new(LoggedConnection {
            id: descriptor.id().clone(),
        }))
    }
}
