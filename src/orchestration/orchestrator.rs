//! # Orchestrator
//!
//! Entry point for running a [`JobDefinition`]. [`Orchestrator::execute`] validates the
//! definition, creates the manager job and hands the rest to a background driver task,
//! returning the manager id without waiting for any step.
//!
//! The driver walks the definition in dependency waves. Steps in a wave run
//! concurrently; a step whose executor creates child jobs must reach a terminal status
//! before the next wave is routed, so later steps can read its recorded outputs. Once
//! the last wave has been routed the manager is handed to the progress aggregator,
//! which completes it when its steps are done.
//!
//! Per-step `on_error` policies:
//!
//! | policy     | on executor error / failed step                                   |
//! |------------|--------------------------------------------------------------------|
//! | `fail`     | fail the manager with the step's error and cancel remaining work  |
//! | `continue` | mark the step failed and keep running independent steps          |
//! | `retry`    | re-dispatch with exponential backoff, then behave like `fail`     |

use crate::config::OrchestrationConfig;
use crate::constants::metadata as meta;
use crate::error::{JobError, JobResult};
use crate::logging::{log_error, log_job_operation, log_step_operation};
use crate::models::{Job, JobDefinition, JobKind, JobSpec, LogLevel, OnError, Step};
use crate::orchestration::job_manager::JobManager;
use crate::orchestration::plan::ExecutionPlan;
use crate::orchestration::progress_aggregator::ProgressAggregator;
use crate::orchestration::step_router::{RoutedStep, StepRouter};
use crate::state_machine::JobStatus;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// How one step ended from the driver's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
enum StepOutcome {
    Completed,
    /// Failed under `on_error = continue`
    Tolerated,
    /// Failed under `fail` or an exhausted `retry`; carries the manager's error message
    Failed(String),
    Cancelled,
}

impl StepOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Tolerated => "failed_tolerated",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

pub struct Orchestrator {
    jobs: Arc<JobManager>,
    router: Arc<StepRouter>,
    aggregator: Arc<ProgressAggregator>,
    config: OrchestrationConfig,
    drivers: DashMap<String, JoinHandle<()>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("drivers", &self.drivers.len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<JobManager>,
        router: Arc<StepRouter>,
        aggregator: Arc<ProgressAggregator>,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            jobs,
            router,
            aggregator,
            config,
            drivers: DashMap::new(),
        }
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// Every check `execute` performs before creating anything
    pub fn validate(&self, definition: &JobDefinition) -> JobResult<ExecutionPlan> {
        definition.validate().map_err(JobError::Validation)?;
        let plan = ExecutionPlan::build(definition)?;
        for step in &definition.steps {
            self.router.validate(step)?;
        }
        Ok(plan)
    }

    /// Validate `definition`, create its manager job and start driving it in the
    /// background. Returns the manager job id.
    #[instrument(skip_all, fields(definition_id = %definition.id))]
    pub async fn execute(self: &Arc<Self>, definition: JobDefinition) -> JobResult<String> {
        let plan = self.validate(&definition)?;

        let mut spec = JobSpec::new(definition.name.clone())
            .with_metadata(meta::JOB_DEFINITION_ID, definition.id.clone())
            .with_metadata(meta::JOB_DEFINITION_NAME, definition.name.clone())
            .with_metadata(meta::STEP_DEFINITIONS, serde_json::to_value(&definition.steps)?)
            .with_metadata(meta::TOTAL_STEPS, definition.steps.len())
            .with_metadata(meta::COMPLETED_STEPS, 0);
        if let Some(tolerance) = &definition.error_tolerance {
            spec = spec.with_metadata(meta::ERROR_TOLERANCE, serde_json::to_value(tolerance)?);
        }
        let manager = self.jobs.create_job(JobKind::Manager, None, spec).await?;
        let manager_id = manager.id.clone();

        info!(
            manager_id = %manager_id,
            total_steps = definition.steps.len(),
            waves = plan.waves().len(),
            "Starting job definition"
        );
        log_job_operation(
            "execute",
            &manager_id,
            manager.kind.as_str(),
            manager.status.as_str(),
            Some(&definition.id),
        );

        self.drivers.retain(|_, handle| !handle.is_finished());
        let orchestrator = Arc::clone(self);
        let span = info_span!("driver", manager_id = %manager_id, definition_id = %definition.id);
        let driver_manager_id = manager_id.clone();
        let handle = tokio::spawn(
            async move {
                orchestrator
                    .run_driver(&driver_manager_id, definition, plan)
                    .await;
            }
            .instrument(span),
        );
        self.drivers.insert(manager_id.clone(), handle);

        Ok(manager_id)
    }

    /// Cancel a running manager job and its whole tree
    pub async fn cancel(&self, manager_id: &str) -> JobResult<usize> {
        let manager = self.jobs.get_job(manager_id).await?;
        if manager.kind != JobKind::Manager {
            return Err(JobError::validation(format!(
                "job {manager_id} is a {} job, not a manager",
                manager.kind
            )));
        }
        self.jobs
            .cancel_job_tree(manager_id, "Job cancelled by request")
            .await
    }

    /// Wait until the manager job is terminal
    pub async fn wait_for_completion(&self, manager_id: &str) -> JobResult<Job> {
        self.jobs
            .wait_for_terminal(manager_id, &CancellationToken::new())
            .await
    }

    /// Number of driver tasks still running
    pub fn active_drivers(&self) -> usize {
        self.drivers.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every driver task to finish
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.drivers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, handle)) = self.drivers.remove(&id) {
                if let Err(err) = handle.await {
                    warn!(manager_id = %id, error = %err, "Driver task ended abnormally");
                }
            }
        }
    }

    async fn run_driver(&self, manager_id: &str, definition: JobDefinition, plan: ExecutionPlan) {
        match self.drive(manager_id, &definition, &plan).await {
            Ok(()) => {}
            Err(JobError::Cancelled { .. }) => {
                info!(manager_id, "Driver stopped: job tree cancelled");
            }
            Err(err) => {
                log_error("orchestrator", "drive", &err.to_string(), Some(manager_id));
                if let Err(fail_err) = self.fail_manager(manager_id, err.to_string()).await {
                    error!(manager_id, error = %fail_err, "Failed to mark manager as failed");
                }
            }
        }
    }

    async fn drive(
        &self,
        manager_id: &str,
        definition: &JobDefinition,
        plan: &ExecutionPlan,
    ) -> JobResult<()> {
        let cancel = self.jobs.cancellation_token(manager_id);
        self.jobs
            .update_status(manager_id, JobStatus::Running, None)
            .await?;

        let mut completed_steps = 0usize;
        for (wave_index, wave) in plan.waves().iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled {
                    job_id: manager_id.to_string(),
                });
            }

            let steps: Vec<&Step> = wave.iter().map(|&i| &definition.steps[i]).collect();
            let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
            let mut patch = Map::new();
            patch.insert(meta::CURRENT_STEP.into(), Value::from(wave[0]));
            patch.insert(meta::CURRENT_STEP_NAME.into(), Value::from(names.join(", ")));
            self.jobs.update_metadata(manager_id, patch).await?;
            debug!(manager_id, wave_index, steps = ?names, "Routing wave");

            let cancel = &cancel;
            let mut running: FuturesUnordered<_> = steps
                .iter()
                .map(|step| async move {
                    let outcome = self.run_step(step, definition, manager_id, cancel).await;
                    (step.name.as_str(), outcome)
                })
                .collect();

            let mut abort = None;
            while let Some((step_name, outcome)) = running.next().await {
                let outcome = outcome?;
                log_step_operation(
                    "step_finished",
                    manager_id,
                    None,
                    step_name,
                    outcome.label(),
                    None,
                );
                match outcome {
                    StepOutcome::Completed | StepOutcome::Tolerated => completed_steps += 1,
                    StepOutcome::Failed(message) => {
                        if abort.is_none() {
                            warn!(manager_id, step_name, error = %message, "Aborting job after step failure");
                            // Failing the manager cancels its scope, which unblocks siblings
                            self.fail_manager(manager_id, message.clone()).await?;
                            abort = Some(message);
                        }
                    }
                    StepOutcome::Cancelled => {}
                }
            }
            drop(running);

            self.record_wave_progress(manager_id, completed_steps).await?;
            if abort.is_some() {
                return Ok(());
            }
        }

        if cancel.is_cancelled() {
            return Err(JobError::Cancelled {
                job_id: manager_id.to_string(),
            });
        }
        info!(manager_id, completed_steps, "All steps routed");
        self.aggregator.monitor(manager_id).await
    }

    async fn run_step(
        &self,
        step: &Step,
        definition: &JobDefinition,
        manager_id: &str,
        cancel: &CancellationToken,
    ) -> JobResult<StepOutcome> {
        let max_attempts = self.config.step_retry_attempts.max(1);
        let mut attempt = 1;
        let mut result = self.router.route(step, definition, manager_id, cancel).await;

        loop {
            let err = match result {
                Ok(routed) => return self.await_step(step, routed, cancel).await,
                Err(JobError::Cancelled { .. }) => return Ok(StepOutcome::Cancelled),
                Err(err) => err,
            };

            // Errors before the step job existed have nothing to retry against
            let Some(step_job_id) = err.as_executor_error().map(|e| e.job_id.clone()) else {
                return Err(err);
            };
            let message = err
                .as_executor_error()
                .map_or_else(|| err.to_string(), ToString::to_string);

            if step.on_error == OnError::Retry && attempt < max_attempts {
                let delay = self.config.step_retry_backoff.next(attempt - 1);
                attempt += 1;
                info!(step_name = %step.name, attempt, max_attempts, ?delay, "Retrying step");
                self.jobs
                    .add_job_log(
                        &step_job_id,
                        LogLevel::Warn,
                        format!("Retrying step (attempt {attempt} of {max_attempts})"),
                    )
                    .await?;
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(StepOutcome::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                result = self.router.dispatch(step, definition, &step_job_id, cancel).await;
                continue;
            }

            self.jobs
                .update_status(&step_job_id, JobStatus::Failed, Some(message.clone()))
                .await?;
            return Ok(match step.on_error {
                OnError::Continue => {
                    info!(step_name = %step.name, error = %message, "Continuing after step failure");
                    StepOutcome::Tolerated
                }
                OnError::Fail | OnError::Retry => StepOutcome::Failed(message),
            });
        }
    }

    /// Block until a monitored step is terminal and map its status to an outcome
    async fn await_step(
        &self,
        step: &Step,
        routed: RoutedStep,
        cancel: &CancellationToken,
    ) -> JobResult<StepOutcome> {
        if !routed.monitored {
            return Ok(StepOutcome::Completed);
        }
        let step_job = match self.jobs.wait_for_terminal(&routed.step_job_id, cancel).await {
            Ok(job) => job,
            Err(JobError::Cancelled { .. }) => return Ok(StepOutcome::Cancelled),
            Err(err) => return Err(err),
        };

        Ok(match step_job.status {
            JobStatus::Completed => StepOutcome::Completed,
            JobStatus::Failed if step.on_error == OnError::Continue => StepOutcome::Tolerated,
            JobStatus::Failed => StepOutcome::Failed(format!(
                "step '{}' (job {}) failed: {}",
                step.name,
                step_job.id,
                step_job.error.as_deref().unwrap_or("child jobs failed")
            )),
            _ => StepOutcome::Cancelled,
        })
    }

    async fn record_wave_progress(&self, manager_id: &str, completed_steps: usize) -> JobResult<()> {
        let mut step_stats = Map::new();
        for step_job in self.jobs.list_children(manager_id).await? {
            let stats = self.jobs.get_child_stats(&step_job.id).await?;
            let name = step_job.step_name().unwrap_or(&step_job.name).to_string();
            step_stats.insert(name, serde_json::to_value(stats)?);
        }
        let mut patch = Map::new();
        patch.insert(meta::COMPLETED_STEPS.into(), Value::from(completed_steps));
        patch.insert(meta::STEP_STATS.into(), Value::Object(step_stats));
        self.jobs.update_metadata(manager_id, patch).await?;
        Ok(())
    }

    /// Fail the manager, then cancel whatever is still running beneath it
    async fn fail_manager(&self, manager_id: &str, message: String) -> JobResult<()> {
        self.jobs
            .update_status(manager_id, JobStatus::Failed, Some(message.clone()))
            .await?;
        self.jobs.cancel_job_tree(manager_id, &message).await?;
        Ok(())
    }
}
