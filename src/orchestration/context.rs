//! Per-invocation context handed to step executors.
//!
//! A [`StepContext`] is a cheap value: each executor call gets its own copy carrying the
//! step job's identity, the tree's cancellation token and a tracing span. Cloning it for
//! spawned sub-tasks never shares mutable state.

use crate::constants::metadata as meta;
use crate::error::{JobError, JobResult};
use crate::models::{Job, JobKind, JobLogEntry, JobSpec, LogLevel};
use crate::orchestration::job_manager::{JobManager, StatusUpdate};
use crate::state_machine::JobStatus;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Span};

#[derive(Clone)]
pub struct StepContext {
    jobs: Arc<JobManager>,
    manager_id: String,
    step_job_id: String,
    step_name: String,
    cancel: CancellationToken,
    span: Span,
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("manager_id", &self.manager_id)
            .field("step_job_id", &self.step_job_id)
            .field("step_name", &self.step_name)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl StepContext {
    pub(crate) fn new(jobs: Arc<JobManager>, step_job: &Job, cancel: CancellationToken) -> Self {
        let step_name = step_job.step_name().unwrap_or(&step_job.name).to_string();
        let span = tracing::info_span!(
            "step",
            manager_id = %step_job.root_id(),
            step_job_id = %step_job.id,
            step_name = %step_name,
        );
        Self {
            manager_id: step_job.root_id().to_string(),
            step_job_id: step_job.id.clone(),
            step_name,
            jobs,
            cancel,
            span,
        }
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn step_job_id(&self) -> &str {
        &self.step_job_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Span to instrument executor work with
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Create a `pending` worker job under this step.
    ///
    /// Fails with [`JobError::Cancelled`] once the tree is cancelled.
    pub async fn create_worker_job(&self, spec: JobSpec) -> JobResult<Job> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled {
                job_id: self.step_job_id.clone(),
            });
        }
        let worker = self
            .jobs
            .create_job(JobKind::Worker, Some(&self.step_job_id), spec)
            .await?;
        debug!(parent: &self.span, worker_id = %worker.id, job_type = %worker.job_type, "Created worker job");
        Ok(worker)
    }

    pub async fn start_worker(&self, worker_id: &str) -> JobResult<StatusUpdate> {
        self.jobs
            .update_status(worker_id, JobStatus::Running, None)
            .await
    }

    pub async fn complete_worker(&self, worker_id: &str) -> JobResult<StatusUpdate> {
        self.jobs
            .update_status(worker_id, JobStatus::Completed, None)
            .await
    }

    pub async fn fail_worker(&self, worker_id: &str, error: impl Into<String>) -> JobResult<StatusUpdate> {
        self.jobs
            .update_status(worker_id, JobStatus::Failed, Some(error.into()))
            .await
    }

    /// Record a named output that later steps can reference as `{step_name.key}`
    pub async fn record_output(&self, key: &str, value: impl Into<Value>) -> JobResult<()> {
        self.jobs
            .set_nested_metadata(&self.step_job_id, meta::OUTPUTS, key, value.into())
            .await?;
        Ok(())
    }

    /// Append to the step job's log stream
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> JobResult<JobLogEntry> {
        self.jobs.add_job_log(&self.step_job_id, level, message).await
    }

    /// Add `delta` documents to both the step and its manager
    pub async fn add_documents(&self, delta: i64) -> JobResult<i64> {
        self.jobs
            .increment_metadata_counter(&self.step_job_id, meta::DOCUMENT_COUNT, delta)
            .await?;
        self.jobs
            .increment_metadata_counter(&self.manager_id, meta::DOCUMENT_COUNT, delta)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryJobStore;

    async fn context() -> StepContext {
        let jobs = Arc::new(JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(EventBus::default()),
        ));
        let manager = jobs
            .create_job(JobKind::Manager, None, JobSpec::new("def"))
            .await
            .unwrap();
        let step = jobs
            .create_job(
                JobKind::Step,
                Some(&manager.id),
                JobSpec::new("crawl").with_metadata(meta::STEP_NAME, "crawl"),
            )
            .await
            .unwrap();
        let token = jobs.cancellation_token(&step.id);
        StepContext::new(jobs, &step, token)
    }

    #[tokio::test]
    async fn test_outputs_and_documents_are_recorded() {
        let ctx = context().await;
        ctx.record_output("urls", 3).await.unwrap();
        ctx.add_documents(5).await.unwrap();

        let step = ctx.job_manager().get_job(ctx.step_job_id()).await.unwrap();
        assert_eq!(step.metadata[meta::OUTPUTS]["urls"], Value::from(3));
        assert_eq!(step.document_count(), 5);
        let manager = ctx.job_manager().get_job(ctx.manager_id()).await.unwrap();
        assert_eq!(manager.document_count(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_context_refuses_new_workers() {
        let ctx = context().await;
        let worker = ctx.create_worker_job(JobSpec::new("w")).await.unwrap();
        assert_eq!(worker.step_name(), Some("crawl"));

        ctx.job_manager()
            .cancel_job_tree(ctx.manager_id(), "test")
            .await
            .unwrap();
        assert!(ctx.is_cancelled());
        assert!(matches!(
            ctx.create_worker_job(JobSpec::new("late")).await,
            Err(JobError::Cancelled { .. })
        ));
    }
}
