//! # Job Manager
//!
//! Owns the job record lifecycle: create, read, status transitions, metadata updates,
//! job logs and tree cancellation.
//!
//! ## Status writes
//!
//! [`JobManager::update_status`] serializes writers for the same job through a per-job
//! async lock and commits through the store's version check. The forward-only guard in
//! [`crate::state_machine`] turns writes against a terminal job into
//! [`StatusUpdate::Ignored`] rather than errors. The status-change event is enqueued on
//! the bus while the per-job lock is still held, so subscribers observe a job's status
//! changes in commit order. Enqueueing never waits on a subscriber.
//!
//! Parents that finish on their own go through [`JobManager::settle_status`], which
//! yields to an in-flight [`JobManager::cancel_job_tree`]: once a job's cancellation
//! scope is signalled, only the tree walk may finalize it, and it writes `cancelled`.
//!
//! ## Logs
//!
//! Appends for the same job are serialized so each entry's timestamp and sequence
//! follow append order. Appends for different jobs never wait on each other; only the
//! timestamp source is shared, behind a short synchronous lock.

use crate::constants::metadata as meta;
use crate::error::{JobError, JobResult, StoreError, StoreResult};
use crate::events::{payloads, EventBus};
use crate::models::{ChildStats, Job, JobKind, JobLogEntry, JobSpec, LogLevel};
use crate::state_machine::{evaluate_transition, JobStatus, TransitionDecision};
use crate::store::{with_contention_retry, JobListOptions, JobStore, StoreRetryPolicy};
use crate::utils::KeyedLocks;
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of a status write
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    /// The new status was committed
    Applied(Job),
    /// The write was a no-op; carries the stored record and the reason
    Ignored(Job, TransitionDecision),
}

impl StatusUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            Self::Applied(job) | Self::Ignored(job, _) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Applied(job) | Self::Ignored(job, _) => job,
        }
    }
}

/// Hands out strictly increasing microsecond timestamps so a burst of log lines sorts
/// back into append order
#[derive(Debug)]
struct LogClock {
    last: Mutex<DateTime<Utc>>,
}

impl LogClock {
    fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    fn next(&self) -> DateTime<Utc> {
        Self::advance(&mut self.last.lock())
    }

    fn advance(last: &mut DateTime<Utc>) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let next = if now > *last {
            now
        } else {
            *last + ChronoDuration::microseconds(1)
        };
        *last = next;
        next
    }
}

/// Job record lifecycle owner; share it behind an `Arc`
pub struct JobManager {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    retry: StoreRetryPolicy,
    status_locks: KeyedLocks,
    log_locks: KeyedLocks,
    /// Cancellation scopes for live manager and step jobs
    tokens: DashMap<String, CancellationToken>,
    clock: LogClock,
    wait_poll_interval: Duration,
    publish_debug_logs: bool,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("store", &self.store)
            .field("retry", &self.retry)
            .field("live_scopes", &self.tokens.len())
            .finish()
    }
}

fn storage_error(job_id: &str, err: StoreError) -> JobError {
    match err {
        StoreError::Missing { .. } => JobError::not_found(job_id),
        other => JobError::Storage(other),
    }
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            retry: StoreRetryPolicy::default(),
            status_locks: KeyedLocks::new(),
            log_locks: KeyedLocks::new(),
            tokens: DashMap::new(),
            clock: LogClock::new(),
            wait_poll_interval: Duration::from_millis(250),
            publish_debug_logs: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: StoreRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Publish `job.log` for debug entries too; they are always stored
    pub fn with_debug_log_publishing(mut self, enabled: bool) -> Self {
        self.publish_debug_logs = enabled;
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Creation and reads
    // ------------------------------------------------------------------

    /// Insert a new `pending` job under `parent_id`.
    ///
    /// Managers have no parent, steps hang under a manager and workers under a step.
    /// Creating a child moves a `pending` parent to `running`. Creation under a terminal
    /// parent or inside a cancelled tree is rejected.
    #[instrument(skip(self, spec), fields(kind = %kind, name = %spec.name))]
    pub async fn create_job(
        &self,
        kind: JobKind,
        parent_id: Option<&str>,
        spec: JobSpec,
    ) -> JobResult<Job> {
        let parent = match (kind.required_parent_kind(), parent_id) {
            (None, None) => None,
            (None, Some(_)) => {
                return Err(JobError::validation("manager jobs cannot have a parent"));
            }
            (Some(required), None) => {
                return Err(JobError::validation(format!(
                    "{kind} jobs require a {required} parent"
                )));
            }
            (Some(required), Some(parent_id)) => {
                let parent = self.get_job(parent_id).await?;
                if parent.kind != required {
                    return Err(JobError::validation(format!(
                        "{kind} jobs must be created under a {required} job, {} is a {}",
                        parent.id, parent.kind
                    )));
                }
                self.ensure_accepts_children(&parent)?;
                Some(parent)
            }
        };

        let mut job = Job::new(kind, spec, parent.as_ref());
        if let Some(parent) = &parent {
            // Workers inherit the step tag so logs and events never walk the chain
            if let Some(step_name) = parent.step_name() {
                job.metadata
                    .entry(meta::STEP_NAME.to_string())
                    .or_insert_with(|| Value::String(step_name.to_string()));
            }
        }

        let insert = with_contention_retry(&self.retry, "create_job", || {
            let job = &job;
            async move { self.store.insert_job(job).await }
        })
        .await;
        insert.map_err(|err| storage_error(&job.id, err))?;
        self.register_scope(&job);

        info!(
            job_id = %job.id,
            parent_id = ?job.parent_id,
            job_type = %job.job_type,
            "Created job"
        );

        if let Some(parent) = parent {
            if self.scope_cancelled(&parent.id) {
                // Cancelled between the check and the insert
                self.update_status(&job.id, JobStatus::Cancelled, Some("job tree cancelled".into()))
                    .await?;
                return Err(JobError::Cancelled { job_id: parent.id });
            }
            if parent.status == JobStatus::Pending {
                self.update_status(&parent.id, JobStatus::Running, None).await?;
            }
        }

        Ok(job)
    }

    fn ensure_accepts_children(&self, parent: &Job) -> JobResult<()> {
        if parent.status == JobStatus::Cancelled || self.scope_cancelled(&parent.id) {
            return Err(JobError::Cancelled {
                job_id: parent.id.clone(),
            });
        }
        if parent.is_terminal() {
            return Err(JobError::validation(format!(
                "parent job {} is already {}",
                parent.id, parent.status
            )));
        }
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> JobResult<Job> {
        self.store
            .get_job(job_id)
            .await
            .map_err(|err| storage_error(job_id, err))?
            .ok_or_else(|| JobError::not_found(job_id))
    }

    pub async fn list_children(&self, parent_id: &str) -> JobResult<Vec<Job>> {
        self.store
            .list_children(parent_id)
            .await
            .map_err(|err| storage_error(parent_id, err))
    }

    /// Manager jobs, newest first, skipping `offset` and returning at most `limit`
    pub async fn list_managers(&self, limit: Option<usize>, offset: usize) -> JobResult<Vec<Job>> {
        let options = JobListOptions::managers()
            .newest_first()
            .with_page(limit, offset);
        self.list_jobs(&options).await
    }

    /// Jobs matching `options`, ordered and paged as it requests
    pub async fn list_jobs(&self, options: &JobListOptions) -> JobResult<Vec<Job>> {
        Ok(self.store.list_jobs(options).await?)
    }

    /// Number of jobs matching the filters in `options`, ignoring paging
    pub async fn count_jobs(&self, options: &JobListOptions) -> JobResult<usize> {
        Ok(self.store.count_jobs(options).await?)
    }

    /// Histogram of the direct children's current statuses
    pub async fn get_child_stats(&self, parent_id: &str) -> JobResult<ChildStats> {
        let children = self.list_children(parent_id).await?;
        Ok(ChildStats::from_statuses(children.iter().map(|c| c.status)))
    }

    /// Work-unit histogram for a manager: every step's workers, or the step itself
    /// when it created none
    pub async fn get_tree_stats(&self, manager_id: &str) -> JobResult<ChildStats> {
        let mut stats = ChildStats::default();
        for step in self.list_children(manager_id).await? {
            let workers = self.list_children(&step.id).await?;
            if workers.is_empty() {
                stats.record(step.status);
            } else {
                stats.merge(&ChildStats::from_statuses(workers.iter().map(|w| w.status)));
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Forward-only status write.
    ///
    /// Returns [`StatusUpdate::Ignored`] when the stored status is terminal or equal to
    /// `status`; an error only when the record is missing or the store fails.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> JobResult<StatusUpdate> {
        self.write_status(job_id, status, error, false).await
    }

    /// Status write for a job that finished on its own.
    ///
    /// When the job's cancellation scope is already signalled the write is ignored with
    /// [`TransitionDecision::ScopeCancelled`] and the job is left for the tree walk to
    /// mark `cancelled`. The check runs under the per-job status lock.
    pub(crate) async fn settle_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> JobResult<StatusUpdate> {
        self.write_status(job_id, status, error, true).await
    }

    #[instrument(skip(self, error), fields(status = %status))]
    async fn write_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
        yield_to_cancel: bool,
    ) -> JobResult<StatusUpdate> {
        let _guard = self.status_locks.lock(job_id).await;

        let outcome = with_contention_retry(&self.retry, "update_status", || {
            self.try_update_status(job_id, status, error.clone(), yield_to_cancel)
        })
        .await
        .map_err(|err| storage_error(job_id, err))?;

        let job = match &outcome {
            StatusUpdate::Applied(job) => job,
            StatusUpdate::Ignored(job, decision) => {
                debug!(job_id, current = %job.status, reason = decision.reason(), "Status write ignored");
                return Ok(outcome);
            }
        };

        info!(job_id, job_kind = %job.kind, error = ?job.error, "Job status changed");

        if let Err(err) = self
            .append_log_for(job, LogLevel::Info, format!("Status changed: {status}"))
            .await
        {
            warn!(job_id, error = %err, "Failed to append status log entry");
        }

        let now = Utc::now();
        self.bus.publish(payloads::status_changed(job, now));
        if let Some(event) = payloads::lifecycle(job, now) {
            self.bus.publish(event);
        }

        if status.is_terminal() {
            if let Some((_, token)) = self.tokens.remove(job_id) {
                token.cancel();
            }
        }

        Ok(outcome)
    }

    async fn try_update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
        yield_to_cancel: bool,
    ) -> StoreResult<StatusUpdate> {
        let current = self.load_for_write(job_id).await?;
        let mut decision = evaluate_transition(current.status, status);
        if decision.should_apply() && yield_to_cancel && self.scope_cancelled(job_id) {
            decision = TransitionDecision::ScopeCancelled;
        }
        if !decision.should_apply() {
            return Ok(StatusUpdate::Ignored(current, decision));
        }
        let mut next = current.clone();
        next.apply_status(status, error);
        let committed = self.store.update_job(&next, current.version).await?;
        Ok(StatusUpdate::Applied(committed))
    }

    async fn load_for_write(&self, job_id: &str) -> StoreResult<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| StoreError::Missing {
                key: job_id.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Read-modify-write a job record under optimistic retry
    async fn modify_job<F>(&self, job_id: &str, operation: &str, modify: F) -> JobResult<Job>
    where
        F: Fn(&mut Job) + Send + Sync,
    {
        with_contention_retry(&self.retry, operation, || self.try_modify(job_id, &modify))
            .await
            .map_err(|err| storage_error(job_id, err))
    }

    async fn try_modify<F>(&self, job_id: &str, modify: &F) -> StoreResult<Job>
    where
        F: Fn(&mut Job) + Send + Sync,
    {
        let current = self.load_for_write(job_id).await?;
        let mut next = current.clone();
        modify(&mut next);
        next.updated_at = Utc::now();
        self.store.update_job(&next, current.version).await
    }

    /// Shallow merge of `patch` into the job's metadata; last writer wins per field
    pub async fn update_metadata(&self, job_id: &str, patch: Map<String, Value>) -> JobResult<Job> {
        self.modify_job(job_id, "update_metadata", |job| {
            job.merge_metadata(patch.clone())
        })
        .await
    }

    /// Atomically add `delta` to an integer metadata field and return the new value
    pub async fn increment_metadata_counter(
        &self,
        job_id: &str,
        key: &str,
        delta: i64,
    ) -> JobResult<i64> {
        let job = self
            .modify_job(job_id, "increment_metadata_counter", |job| {
                let current = job.metadata_i64(key).unwrap_or(0);
                job.metadata
                    .insert(key.to_string(), Value::from(current.saturating_add(delta)));
            })
            .await?;
        Ok(job.metadata_i64(key).unwrap_or(0))
    }

    pub async fn add_job_error(&self, job_id: &str, message: &str) -> JobResult<Job> {
        self.push_metadata_string(job_id, meta::ERRORS, message).await
    }

    pub async fn add_job_warning(&self, job_id: &str, message: &str) -> JobResult<Job> {
        self.push_metadata_string(job_id, meta::WARNINGS, message).await
    }

    async fn push_metadata_string(&self, job_id: &str, key: &str, message: &str) -> JobResult<Job> {
        self.modify_job(job_id, "push_metadata_string", |job| {
            let entry = job
                .metadata
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            if let Value::Array(items) = entry {
                items.push(Value::String(message.to_string()));
            }
        })
        .await
    }

    /// Set `metadata[outer][key] = value`, creating the nested map when missing
    pub(crate) async fn set_nested_metadata(
        &self,
        job_id: &str,
        outer: &str,
        key: &str,
        value: Value,
    ) -> JobResult<Job> {
        self.modify_job(job_id, "set_nested_metadata", |job| {
            let entry = job
                .metadata
                .entry(outer.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(map) = entry {
                map.insert(key.to_string(), value.clone());
            }
        })
        .await
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Append a log line to the job's stream and publish `job.log`. Debug entries are
    /// stored but only published when debug log publishing is enabled.
    pub async fn add_job_log(
        &self,
        job_id: &str,
        level: LogLevel,
        message: impl Into<String>,
    ) -> JobResult<JobLogEntry> {
        let job = self.get_job(job_id).await?;
        self.append_log_for(&job, level, message.into()).await
    }

    async fn append_log_for(
        &self,
        job: &Job,
        level: LogLevel,
        message: String,
    ) -> JobResult<JobLogEntry> {
        let guard = self.log_locks.lock(&job.id).await;
        let mut entry = JobLogEntry::new(&job.id, level, message, self.clock.next());
        entry.step_name = job.step_name().map(str::to_string);
        entry.manager_id = Some(job.root_id().to_string());
        entry.originator = Some(job.job_type.clone());

        let stored = self.store.append_log(entry).await?;
        drop(guard);
        if self.should_publish(level) {
            self.bus.publish(payloads::log(&stored));
        }
        Ok(stored)
    }

    fn should_publish(&self, level: LogLevel) -> bool {
        level != LogLevel::Debug || self.publish_debug_logs
    }

    /// Log entries in append order; with a limit, the most recent ones
    pub async fn get_job_logs(&self, job_id: &str, limit: Option<usize>) -> JobResult<Vec<JobLogEntry>> {
        Ok(self.store.get_logs(job_id, limit).await?)
    }

    // ------------------------------------------------------------------
    // Cancellation and waiting
    // ------------------------------------------------------------------

    fn register_scope(&self, job: &Job) {
        let token = match job.kind {
            JobKind::Manager => CancellationToken::new(),
            JobKind::Step => job
                .parent_id
                .as_deref()
                .and_then(|parent| self.tokens.get(parent).map(|t| t.child_token()))
                .unwrap_or_default(),
            JobKind::Worker => return,
        };
        self.tokens.insert(job.id.clone(), token);
    }

    /// Whether the job's cancellation scope has been signalled. Jobs without a live
    /// scope (workers, terminal jobs) report false.
    pub(crate) fn scope_cancelled(&self, job_id: &str) -> bool {
        self.tokens
            .get(job_id)
            .map(|token| token.is_cancelled())
            .unwrap_or(false)
    }

    /// Cancellation scope of a live manager or step job. A step's token is a child of
    /// its manager's token. Returns a pre-cancelled token for jobs that are no longer live.
    pub fn cancellation_token(&self, job_id: &str) -> CancellationToken {
        match self.tokens.get(job_id) {
            Some(token) => token.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Cancel `job_id` and every non-terminal descendant.
    ///
    /// The tree's cancellation scope is signalled first so executors stop creating
    /// worker jobs; descendants are then marked `cancelled` bottom-up and the job itself
    /// last. Parents that finish on their own after the signal yield to the walk (see
    /// [`JobManager::settle_status`]). Returns how many records were transitioned.
    #[instrument(skip(self, reason))]
    pub async fn cancel_job_tree(&self, job_id: &str, reason: &str) -> JobResult<usize> {
        let root = self.get_job(job_id).await?;
        if let Some(token) = self.tokens.get(job_id) {
            token.cancel();
        }

        let mut levels: Vec<Vec<Job>> = vec![vec![root.clone()]];
        loop {
            let mut next = Vec::new();
            for parent in levels.last().into_iter().flatten() {
                next.extend(self.list_children(&parent.id).await?);
            }
            if next.is_empty() {
                break;
            }
            levels.push(next);
        }

        let mut cancelled = 0;
        for level in levels.iter().rev() {
            for job in level.iter().filter(|j| !j.is_terminal()) {
                let update = self
                    .update_status(&job.id, JobStatus::Cancelled, Some(reason.to_string()))
                    .await?;
                if update.is_applied() {
                    cancelled += 1;
                }
            }
        }

        info!(job_id, cancelled, reason, "Cancelled job tree");
        Ok(cancelled)
    }

    /// Wait until `job_id` reaches a terminal status.
    ///
    /// Wakes on status-change events for the job and re-reads the store on a fixed
    /// interval, so a missed or lagged event only delays the wake-up.
    pub async fn wait_for_terminal(&self, job_id: &str, cancel: &CancellationToken) -> JobResult<Job> {
        let mut stream = self.bus.stream();
        loop {
            let job = self.get_job(job_id).await?;
            if job.is_terminal() {
                return Ok(job);
            }

            let deadline = tokio::time::sleep(self.wait_poll_interval);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(JobError::Cancelled { job_id: job_id.to_string() });
                    }
                    _ = &mut deadline => break,
                    received = stream.recv() => match received {
                        Ok(event) if event.job_id() == Some(job_id) => break,
                        Ok(_) | Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => {
                            (&mut deadline).await;
                            break;
                        }
                    },
                }
            }
        }
    }
}
