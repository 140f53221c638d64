//! Wiring for one worker node: store, registry, lifecycle, engine, scheduler.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::ConnsyncConfig;
use crate::lifecycle::{ConnectionLifecycleManager, QueueConnector, RegisteringLifecycle};
use crate::reconcile::scheduler::ScheduleError;
use crate::reconcile::{ReconciliationEngine, ReconciliationScheduler, TriggerOutcome};
use crate::registry::LocalConnectionRegistry;
use crate::store::ClusterStateStore;

/// A node's reconciliation stack.
pub struct Node<C> {
    name: String,
    registry: Arc<LocalConnectionRegistry>,
    lifecycle: Arc<RegisteringLifecycle<C>>,
    scheduler: ReconciliationScheduler,
}

impl<C: QueueConnector + 'static> Node<C> {
    /// Assemble the stack from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the configured schedule does not parse.
    pub fn new(
        config: &ConnsyncConfig,
        store: Arc<dyn ClusterStateStore>,
        connector: C,
    ) -> Result<Self, ScheduleError> {
        let registry = Arc::new(LocalConnectionRegistry::new());
        let lifecycle = Arc::new(RegisteringLifecycle::new(connector, Arc::clone(&registry)));
        let engine = Arc::new(ReconciliationEngine::new(
            store,
            Arc::clone(&registry),
            Arc::clone(&lifecycle) as Arc<dyn ConnectionLifecycleManager>,
            config.sync.max_concurrency,
        ));
        let scheduler = ReconciliationScheduler::new(engine, &config.sync.schedule)?
            .run_on_start(config.sync.run_on_start);

        Ok(Self {
            name: config.node.name.clone(),
            registry,
            lifecycle,
            scheduler,
        })
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connections open on this node.
    pub fn registry(&self) -> &Arc<LocalConnectionRegistry> {
        &self.registry
    }

    /// The node's scheduler.
    pub fn scheduler(&self) -> &ReconciliationScheduler {
        &self.scheduler
    }

    /// Run a single pass through the single-flight guard.
    pub async fn reconcile_once(&self) -> TriggerOutcome {
        self.scheduler.trigger().await
    }

    /// Reconcile on schedule until shutdown, then close every local
    /// connection.
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) {
        info!(node = %self.name, "node started");
        self.scheduler.run(shutdown_rx).await;
        self.lifecycle.close_all().await;
        info!(node = %self.name, "node stopped");
    }

    /// Close every connection open on this node.
    pub async fn close_all(&self) -> usize {
        self.lifecycle.close_all().await
    }
}
