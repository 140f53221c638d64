//! Cron-driven reconcile passes with per-node single-flight.
//!
//! Each tick spawns its pass on a separate task so the timer keeps firing
//! while a slow pass is in flight. A tick (or manual trigger) that finds a
//! pass already running does nothing but log. Passes never overlap on one
//! node; nothing is coordinated across nodes.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{PassReport, ReconcileError, ReconciliationEngine};

/// Invalid cadence expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schedule '{expr}': {reason}")]
pub struct ScheduleError {
    /// Expression as configured.
    pub expr: String,
    /// Parser message.
    pub reason: String,
}

/// Parse a cron expression (seconds field first, e.g. `*/30 * * * * *`).
///
/// # Errors
///
/// Returns [`ScheduleError`] if the expression does not parse.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(expr).map_err(|e| ScheduleError {
        expr: expr.to_owned(),
        reason: e.to_string(),
    })
}

/// What happened to one trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// The pass ran to completion.
    Completed(PassReport),
    /// The pass was abandoned because the store was unreachable.
    Failed(ReconcileError),
    /// Another pass was already running on this node.
    Skipped,
}

/// Holds the in-progress flag for the duration of one pass.
struct PassGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Wall clock derived from the runtime's monotonic clock.
///
/// Cron fire times are wall-clock, but sleeping uses the runtime timer;
/// anchoring one to the other keeps both in step (including when the
/// runtime clock is paused in tests).
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.mono.elapsed())
            .ok()
            .and_then(|d| self.wall.checked_add_signed(d))
            .unwrap_or_else(Utc::now)
    }
}

/// Runs [`ReconciliationEngine::reconcile_once`] on a cron cadence.
#[derive(Clone)]
pub struct ReconciliationScheduler {
    engine: Arc<ReconciliationEngine>,
    schedule: cron::Schedule,
    in_progress: Arc<AtomicBool>,
    run_on_start: bool,
}

impl ReconciliationScheduler {
    /// Build a scheduler for `expr`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the expression does not parse.
    pub fn new(engine: Arc<ReconciliationEngine>, expr: &str) -> Result<Self, ScheduleError> {
        Ok(Self {
            engine,
            schedule: parse_schedule(expr)?,
            in_progress: Arc::new(AtomicBool::new(false)),
            run_on_start: false,
        })
    }

    /// Also run a pass immediately when [`Self::run`] starts.
    #[must_use]
    pub fn run_on_start(mut self, enabled: bool) -> Self {
        self.run_on_start = enabled;
        self
    }

    /// Whether a pass is currently running on this node.
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Next fire time strictly after `after`.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Run one pass now unless one is already running.
    ///
    /// Never returns an error: store failures are logged and reported as
    /// [`TriggerOutcome::Failed`].
    pub async fn trigger(&self) -> TriggerOutcome {
        let Some(_guard) = PassGuard::acquire(&self.in_progress) else {
            info!("connection sync already in progress, skipping");
            return TriggerOutcome::Skipped;
        };

        debug!("connection sync running");
        match self.engine.reconcile_once().await {
            Ok(report) => TriggerOutcome::Completed(report),
            Err(e) => {
                error!(error = %e, "connection sync pass failed");
                TriggerOutcome::Failed(e)
            }
        }
    }

    /// Fire passes on the schedule until `shutdown_rx` flips to `true` or
    /// its sender is dropped.
    ///
    /// On shutdown no new ticks start; passes already running are awaited
    /// so their dispatched open/close calls complete.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(schedule = %self.schedule, "reconciliation scheduler started");
        let clock = Clock::start();
        let mut passes = JoinSet::new();

        if self.run_on_start {
            self.spawn_pass(&mut passes);
        }

        loop {
            let now = clock.now();
            let Some(next) = self.next_fire_after(now) else {
                warn!(schedule = %self.schedule, "schedule has no future fire times");
                break;
            };
            let wait = next
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                () = tokio::time::sleep(wait) => {
                    debug!(fire_time = %next, "schedule tick");
                    self.spawn_pass(&mut passes);
                }
                Some(joined) = passes.join_next() => {
                    if let Err(e) = joined {
                        error!(error = %e, "reconcile pass task panicked");
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("reconciliation scheduler shutting down");
                        break;
                    }
                }
            }
        }

        if !passes.is_empty() {
            info!(in_flight = passes.len(), "waiting for running pass to finish");
        }
        while let Some(joined) = passes.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "reconcile pass task panicked");
            }
        }
        info!("reconciliation scheduler stopped");
    }

    fn spawn_pass(&self, passes: &mut JoinSet<()>) {
        let this = self.clone();
        passes.spawn(async move {
            // Completed and failed passes are logged by the engine and `trigger`.
            if let TriggerOutcome::Completed(report) = this.trigger().await {
                if !report.is_clean() {
                    warn!(
                        failed = report.failures.len(),
                        panicked = report.panicked,
                        "pass left actions for the next tick"
                    );
                }
            }
        });
    }
}
