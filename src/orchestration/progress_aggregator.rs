//! # Progress Aggregator
//!
//! Turns child status changes into parent summaries. It subscribes to
//! `job.status_changed` and, for every event that names a parent, re-reads the parent's
//! children from the store, derives the parent's overall status and publishes
//! `job.progress` (plus `job.step_progress` for step jobs).
//!
//! Aggregation is level-triggered: the histogram always comes from the store, never
//! from counting events, so duplicated, late or reordered events converge on the same
//! summary. Parents registered with [`ProgressAggregator::monitor`] are finalized once
//! their derived status is terminal, unless their tree is being cancelled: the
//! cancellation walk marks those parents itself.
//!
//! The hierarchy is fixed at three tiers: a worker event refreshes its step and that
//! step's manager, nothing deeper.

use crate::constants::{events as topics, metadata as meta};
use crate::error::{EventError, JobResult};
use crate::events::{payloads, Event, EventHandler, ProgressSnapshot, SubscriptionId};
use crate::models::{ChildStats, ErrorTolerance, FailureAction, Job, JobKind};
use crate::orchestration::job_manager::JobManager;
use crate::state_machine::JobStatus;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const TOLERANCE_WARNING_PREFIX: &str = "Error tolerance exceeded";

/// Overall status of a parent given its children's histogram.
///
/// `tolerated_failures` is the number of failed children whose failure should not fail
/// the parent. A parent without children is complete.
pub fn derive_overall_status(stats: &ChildStats, tolerated_failures: u64) -> JobStatus {
    if stats.total == 0 {
        return JobStatus::Completed;
    }
    if stats.active() > 0 {
        return if stats.pending == stats.total {
            JobStatus::Pending
        } else {
            JobStatus::Running
        };
    }
    if stats.failed > tolerated_failures {
        return JobStatus::Failed;
    }
    if stats.cancelled == stats.total {
        return JobStatus::Cancelled;
    }
    JobStatus::Completed
}

/// Whether a failed `child` leaves `parent` able to complete
fn failure_tolerated(parent: &Job, child: &Job) -> bool {
    match parent.kind {
        JobKind::Step => parent.on_error().tolerates_failures(),
        JobKind::Manager => child.on_error().tolerates_failures(),
        JobKind::Worker => false,
    }
}

/// A parent that is not finalizable (not yet monitored, or inside a cancelled tree) is
/// reported with its stored status rather than a terminal derived one
fn reported_status(parent: &Job, derived: JobStatus, finalizable: bool) -> JobStatus {
    if parent.is_terminal() || (derived.is_terminal() && !finalizable) {
        parent.status
    } else {
        derived
    }
}

fn error_tolerance(job: &Job) -> Option<ErrorTolerance> {
    job.metadata
        .get(meta::ERROR_TOLERANCE)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}

pub struct ProgressAggregator {
    jobs: Arc<JobManager>,
    monitored: DashSet<String>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("monitored", &self.monitored.len())
            .field("subscribed", &self.subscription.lock().is_some())
            .finish()
    }
}

impl ProgressAggregator {
    pub fn new(jobs: Arc<JobManager>) -> Self {
        Self {
            jobs,
            monitored: DashSet::new(),
            subscription: Mutex::new(None),
        }
    }

    /// Subscribe to `job.status_changed`. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut subscription = self.subscription.lock();
        if subscription.is_none() {
            let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
            *subscription = Some(self.jobs.bus().subscribe(topics::JOB_STATUS_CHANGED, handler));
            info!("Progress aggregator subscribed to status changes");
        }
    }

    pub fn stop(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.jobs.bus().unsubscribe(id);
        }
    }

    pub fn is_monitored(&self, job_id: &str) -> bool {
        self.monitored.contains(job_id)
    }

    pub fn monitored_count(&self) -> usize {
        self.monitored.len()
    }

    /// Finalize `parent_id` once every child is terminal. Recomputes immediately so
    /// children that finished before registration are not missed.
    #[instrument(skip(self))]
    pub async fn monitor(&self, parent_id: &str) -> JobResult<()> {
        self.monitored.insert(parent_id.to_string());
        debug!(parent_id, "Monitoring parent job");
        self.refresh(parent_id).await?;
        Ok(())
    }

    /// Handle one `job.status_changed` event
    pub async fn on_status_changed(&self, event: &Event) {
        let Some(parent_id) = event.parent_id() else {
            return;
        };
        let parent = match self.refresh(parent_id).await {
            Ok(parent) => parent,
            Err(err) => {
                warn!(parent_id, error = %err, "Skipping progress update");
                return;
            }
        };
        if parent.kind == JobKind::Step {
            let manager_id = parent.root_id().to_string();
            if let Err(err) = self.refresh(&manager_id).await {
                warn!(manager_id = %manager_id, error = %err, "Skipping manager progress update");
            }
        }
    }

    /// Recompute one parent's summary, publish it and finalize if due.
    /// Returns the parent record as read before any write.
    pub async fn refresh(&self, parent_id: &str) -> JobResult<Job> {
        let parent = self.jobs.get_job(parent_id).await?;
        let children = self.jobs.list_children(parent_id).await?;
        let stats = ChildStats::from_statuses(children.iter().map(|c| c.status));
        let tolerated = children
            .iter()
            .filter(|c| c.status == JobStatus::Failed && failure_tolerated(&parent, c))
            .count() as u64;
        let derived = derive_overall_status(&stats, tolerated);

        // Managers report work units across the whole tree
        let (published_stats, worker_failures) = if parent.kind == JobKind::Manager {
            let tree = self.jobs.get_tree_stats(parent_id).await?;
            (tree, tree.failed)
        } else {
            (stats, stats.failed)
        };

        let finalizable = self.is_monitored(parent_id) && !self.jobs.scope_cancelled(parent_id);
        let snapshot = ProgressSnapshot {
            job_id: parent.id.clone(),
            status: reported_status(&parent, derived, finalizable),
            stats: published_stats,
            document_count: parent.document_count(),
            errors: parent.metadata_strings(meta::ERRORS),
            warnings: parent.metadata_strings(meta::WARNINGS),
        };
        let now = Utc::now();
        if parent.kind == JobKind::Step {
            self.jobs
                .bus()
                .publish(payloads::step_progress(&parent, snapshot.clone(), now));
        }
        self.jobs.bus().publish(payloads::progress(snapshot, now));

        if parent.is_terminal() {
            self.monitored.remove(parent_id);
            return Ok(parent);
        }

        if parent.kind == JobKind::Manager {
            if let Some(tolerance) = error_tolerance(&parent) {
                if self
                    .apply_error_tolerance(&parent, tolerance, worker_failures)
                    .await?
                {
                    self.monitored.remove(parent_id);
                    return Ok(parent);
                }
            }
        }

        if derived.is_terminal() && finalizable {
            self.finalize(&parent, &children, stats, derived, tolerated, worker_failures)
                .await?;
        }
        Ok(parent)
    }

    /// Apply the definition's failure threshold. Returns true when the manager was stopped.
    async fn apply_error_tolerance(
        &self,
        manager: &Job,
        tolerance: ErrorTolerance,
        failed: u64,
    ) -> JobResult<bool> {
        if !tolerance.is_exceeded(failed) {
            return Ok(false);
        }
        let message = format!(
            "{TOLERANCE_WARNING_PREFIX}: {failed} failed child jobs (max {})",
            tolerance.max_child_failures
        );
        match tolerance.failure_action {
            FailureAction::StopAll => {
                warn!(manager_id = %manager.id, failed, "Stopping job tree after too many failures");
                self.jobs
                    .update_status(&manager.id, JobStatus::Failed, Some(message.clone()))
                    .await?;
                self.jobs.cancel_job_tree(&manager.id, &message).await?;
                Ok(true)
            }
            FailureAction::MarkWarning => {
                let already_warned = manager
                    .metadata_strings(meta::WARNINGS)
                    .iter()
                    .any(|w| w.starts_with(TOLERANCE_WARNING_PREFIX));
                if !already_warned {
                    self.jobs.add_job_warning(&manager.id, &message).await?;
                }
                Ok(false)
            }
            FailureAction::Continue => Ok(false),
        }
    }

    async fn finalize(
        &self,
        parent: &Job,
        children: &[Job],
        stats: ChildStats,
        derived: JobStatus,
        tolerated: u64,
        worker_failures: u64,
    ) -> JobResult<()> {
        let mut patch = Map::new();
        patch.insert(meta::CHILD_STATS.to_string(), serde_json::to_value(stats)?);
        patch.insert(meta::FAILED_CHILDREN.to_string(), Value::from(worker_failures));
        if parent.kind == JobKind::Manager {
            let failed_steps: Vec<Value> = children
                .iter()
                .filter(|c| c.status == JobStatus::Failed)
                .map(|c| Value::from(c.step_name().unwrap_or(&c.name)))
                .collect();
            patch.insert(meta::FAILED_STEPS.to_string(), Value::Array(failed_steps));
        }
        if derived == JobStatus::Completed && (stats.failed > 0 || worker_failures > 0) {
            patch.insert(meta::COMPLETED_WITH_ERRORS.to_string(), Value::Bool(true));
        }
        self.jobs.update_metadata(&parent.id, patch).await?;

        let error = (derived == JobStatus::Failed).then(|| {
            format!(
                "{} of {} child jobs failed",
                stats.failed.saturating_sub(tolerated),
                stats.total
            )
        });
        let update = self.jobs.settle_status(&parent.id, derived, error).await?;
        self.monitored.remove(&parent.id);
        info!(
            job_id = %parent.id,
            status = %derived,
            applied = update.is_applied(),
            progress = %stats.progress_text(),
            "Finalized parent job"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ProgressAggregator {
    fn name(&self) -> &str {
        "progress_aggregator"
    }

    async fn handle(&self, event: Arc<Event>) -> Result<(), EventError> {
        self.on_status_changed(&event).await;
        Ok(())
    }
}
