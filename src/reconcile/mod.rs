//! Reconciliation of local connections against the cluster registry.
//!
//! One pass enumerates the desired set, snapshots what is open on this
//! node, and computes additions and removals. Every action re-checks the
//! key in the store immediately before acting, then opens or closes via the
//! lifecycle manager. Actions run concurrently up to a limit and the pass
//! waits for all of them; individual failures are collected, never raised.

pub mod scheduler;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::descriptor::{ConnectionDescriptor, ConnectionId, DescriptorError};
use crate::lifecycle::{ConnectionError, ConnectionLifecycleManager};
use crate::registry::LocalConnectionRegistry;
use crate::store::{ClusterStateStore, RegistryEntry, StoreError};

pub use scheduler::{ReconciliationScheduler, TriggerOutcome};

/// Errors raised by a reconcile pass or one of its actions.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The store could not be enumerated; the whole pass is abandoned.
    #[error(transparent)]
    StateStore(#[from] StoreError),
    /// The existence re-check for one key failed.
    #[error("re-check of {id} failed: {source}")]
    RecheckFailed {
        /// Connection identifier.
        id: ConnectionId,
        /// Store failure.
        source: StoreError,
    },
    /// Opening or closing one connection failed.
    #[error("{action} of {id} failed: {source}")]
    ConnectionActionFailed {
        /// Connection identifier.
        id: ConnectionId,
        /// Attempted action.
        action: Action,
        /// Lifecycle failure.
        source: ConnectionError,
    },
}

/// Kind of convergence action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a connection that is desired but not open.
    Open,
    /// Close a connection that is open but no longer desired.
    Close,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Close => f.write_str("close"),
        }
    }
}

/// Additions and removals computed from one desired/actual comparison.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcilePlan {
    /// Registered and valid, but not open on this node.
    pub additions: Vec<ConnectionId>,
    /// Open on this node, but not registered.
    pub removals: Vec<ConnectionId>,
    /// Registry entries that failed validation, by raw key.
    pub invalid: Vec<(String, DescriptorError)>,
}

impl ReconcilePlan {
    /// Diff the enumerated registry against the local open set.
    ///
    /// An entry whose key parses counts as desired even if the rest of the
    /// descriptor is invalid: it is never opened, but an open connection
    /// under that key is not torn down either.
    pub fn compute(desired: &[RegistryEntry], actual: &BTreeSet<ConnectionId>) -> Self {
        let mut plan = Self::default();
        let mut desired_ids = BTreeSet::new();

        for entry in desired {
            if let Ok(id) = entry.key.parse::<ConnectionId>() {
                desired_ids.insert(id);
            }
            match ConnectionDescriptor::from_value(&entry.key, &entry.value) {
                Ok(descriptor) => {
                    if !actual.contains(descriptor.id()) {
                        plan.additions.push(descriptor.id().clone());
                    }
                }
                Err(e) => plan.invalid.push((entry.key.clone(), e)),
            }
        }

        plan.additions.sort();
        plan.additions.dedup();
        plan.removals = actual.difference(&desired_ids).cloned().collect();
        plan
    }

    /// Whether the plan has nothing to open or close.
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }
}

/// One action that did not complete.
#[derive(Debug)]
pub struct ActionFailure {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Attempted action.
    pub action: Action,
    /// Cause.
    pub error: ReconcileError,
}

/// Result of one reconcile pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Number of registry entries enumerated.
    pub desired: usize,
    /// Number of connections open when the pass started.
    pub open_before: usize,
    /// Connections opened.
    pub opened: Vec<ConnectionId>,
    /// Connections closed.
    pub closed: Vec<ConnectionId>,
    /// Candidates dropped because the re-check disagreed with the enumeration.
    pub stale: Vec<ConnectionId>,
    /// Registry entries skipped as invalid, by raw key.
    pub invalid: Vec<(String, DescriptorError)>,
    /// Actions that failed.
    pub failures: Vec<ActionFailure>,
    /// Action tasks that panicked.
    pub panicked: usize,
    /// Wall-clock duration of the pass.
    pub duration: Duration,
}

impl PassReport {
    /// Whether every attempted action succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.panicked == 0
    }

    /// Number of open and close calls that succeeded.
    pub fn changes(&self) -> usize {
        self.opened.len().saturating_add(self.closed.len())
    }
}

/// Validity of every registry entry, computed without touching connections.
#[derive(Debug, Default)]
pub struct RegistryAudit {
    /// Entries that validate, sorted by id.
    pub valid: Vec<ConnectionDescriptor>,
    /// Entries that do not, by raw key.
    pub invalid: Vec<(String, DescriptorError)>,
}

impl RegistryAudit {
    /// Number of entries examined.
    pub fn total(&self) -> usize {
        self.valid.len().saturating_add(self.invalid.len())
    }
}

/// Enumerate the registry and validate each entry.
///
/// # Errors
///
/// Returns the store error if the registry cannot be enumerated.
pub async fn audit_registry(store: &dyn ClusterStateStore) -> Result<RegistryAudit, StoreError> {
    let mut audit = RegistryAudit::default();
    for entry in store.enumerate_all().await? {
        match ConnectionDescriptor::from_value(&entry.key, &entry.value) {
            Ok(descriptor) => audit.valid.push(descriptor),
            Err(e) => audit.invalid.push((entry.key, e)),
        }
    }
    audit.valid.sort_by(|a, b| a.id().cmp(b.id()));
    Ok(audit)
}

enum ActionOutcome {
    Opened,
    Closed,
    Stale,
    Invalid(String, DescriptorError),
    Failed(ReconcileError),
}

/// Drives local connections toward the cluster-desired set.
pub struct ReconciliationEngine {
    store: Arc<dyn ClusterStateStore>,
    registry: Arc<LocalConnectionRegistry>,
    lifecycle: Arc<dyn ConnectionLifecycleManager>,
    max_concurrency: usize,
}

impl ReconciliationEngine {
    /// Build an engine. `max_concurrency` is clamped to at least one.
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        registry: Arc<LocalConnectionRegistry>,
        lifecycle: Arc<dyn ConnectionLifecycleManager>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run one reconcile pass to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::StateStore`] only when the registry cannot
    /// be enumerated. Action failures are reported in [`PassReport::failures`].
    pub async fn reconcile_once(&self) -> Result<PassReport, ReconcileError> {
        let start = Instant::now();

        let desired = self.store.enumerate_all().await?;
        let actual = self.registry.list_all().await;
        debug!(
            desired = desired.len(),
            open = actual.len(),
            "syncing connections"
        );

        let plan = ReconcilePlan::compute(&desired, &actual);
        let mut report = PassReport {
            desired: desired.len(),
            open_before: actual.len(),
            ..PassReport::default()
        };
        for (key, e) in plan.invalid {
            warn!(connection_id = %key, error = %e, "skipping invalid registry entry");
            report.invalid.push((key, e));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        let actions = plan
            .additions
            .into_iter()
            .map(|id| (id, Action::Open))
            .chain(plan.removals.into_iter().map(|id| (id, Action::Close)));

        for (id, action) in actions {
            let store = Arc::clone(&self.store);
            let lifecycle = Arc::clone(&self.lifecycle);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await;
                let outcome = match action {
                    Action::Open => add_connection(store.as_ref(), lifecycle.as_ref(), &id).await,
                    Action::Close => {
                        remove_connection(store.as_ref(), lifecycle.as_ref(), &id).await
                    }
                };
                (id, action, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, _, ActionOutcome::Opened)) => report.opened.push(id),
                Ok((id, _, ActionOutcome::Closed)) => report.closed.push(id),
                Ok((id, _, ActionOutcome::Stale)) => report.stale.push(id),
                Ok((_, _, ActionOutcome::Invalid(key, e))) => {
                    warn!(connection_id = %key, error = %e, "skipping invalid registry entry");
                    report.invalid.push((key, e));
                }
                Ok((id, action, ActionOutcome::Failed(e))) => {
                    error!(connection_id = %id, %action, error = %e, "connection action failed");
                    report.failures.push(ActionFailure {
                        id,
                        action,
                        error: e,
                    });
                }
                Err(e) => {
                    error!(error = %e, "reconcile action task panicked");
                    report.panicked = report.panicked.saturating_add(1);
                }
            }
        }

        report.opened.sort();
        report.closed.sort();
        report.stale.sort();
        report.duration = start.elapsed();

        info!(
            desired = report.desired,
            open_before = report.open_before,
            opened = report.opened.len(),
            closed = report.closed.len(),
            stale = report.stale.len(),
            invalid = report.invalid.len(),
            failed = report.failures.len(),
            duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            "reconcile pass finished"
        );
        Ok(report)
    }
}

/// Re-check that `id` is still registered, then open it.
async fn add_connection(
    store: &dyn ClusterStateStore,
    lifecycle: &dyn ConnectionLifecycleManager,
    id: &ConnectionId,
) -> ActionOutcome {
    let key = id.to_string();
    let value = match store.get(&key).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!(connection_id = %id, "registration retracted before open, skipping");
            return ActionOutcome::Stale;
        }
        Err(source) => {
            return ActionOutcome::Failed(ReconcileError::RecheckFailed {
                id: id.clone(),
                source,
            })
        }
    };

    let descriptor = match ConnectionDescriptor::from_value(&key, &value) {
        Ok(d) => d,
        Err(e) => return ActionOutcome::Invalid(key, e),
    };

    info!(connection_id = %id, "connecting component");
    match lifecycle.open(&descriptor).await {
        Ok(()) => ActionOutcome::Opened,
        Err(source) => ActionOutcome::Failed(ReconcileError::ConnectionActionFailed {
            id: id.clone(),
            action: Action::Open,
            source,
        }),
    }
}

/// Re-check that `id` is still unregistered, then close it.
async fn remove_connection(
    store: &dyn ClusterStateStore,
    lifecycle: &dyn ConnectionLifecycleManager,
    id: &ConnectionId,
) -> ActionOutcome {
    match store.get(&id.to_string()).await {
        Ok(None) => {}
        Ok(Some(_)) => {
            debug!(connection_id = %id, "registered again before close, keeping");
            return ActionOutcome::Stale;
        }
        Err(source) => {
            return ActionOutcome::Failed(ReconcileError::RecheckFailed {
                id: id.clone(),
                source,
            })
        }
    }

    info!(connection_id = %id, "disconnecting component");
    match lifecycle.close(id).await {
        Ok(()) => ActionOutcome::Closed,
        Err(source) => ActionOutcome::Failed(ReconcileError::ConnectionActionFailed {
            id: id.clone(),
            action: Action::Close,
            source,
        }),
    }
}
