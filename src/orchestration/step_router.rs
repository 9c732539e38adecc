//! # Step Router
//!
//! Maps a step to the executor registered for its type, creates the step job and
//! invokes the executor with a fresh [`StepContext`].
//!
//! Executor failures are recorded on the step job and surfaced as
//! [`ExecutorError`]; the router never decides the step's fate after a failure. That is
//! the orchestrator's job, driven by the step's `on_error` policy.

use crate::constants::{fields, metadata as meta};
use crate::error::{ExecutorError, JobError, JobResult};
use crate::logging::log_step_operation;
use crate::models::{Job, JobDefinition, JobKind, JobSpec, LogLevel, Step};
use crate::orchestration::context::StepContext;
use crate::orchestration::job_manager::JobManager;
use crate::orchestration::placeholders::{self, PlaceholderScope};
use crate::orchestration::progress_aggregator::ProgressAggregator;
use crate::registry::{StepExecutor, StepExecutorRegistry};
use crate::state_machine::JobStatus;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};

/// Outcome of routing one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedStep {
    pub step_job_id: String,
    /// The step job was handed to the progress aggregator and finishes when its
    /// workers do; otherwise it was completed on return from the executor
    pub monitored: bool,
}

#[derive(Debug)]
pub struct StepRouter {
    registry: Arc<StepExecutorRegistry>,
    jobs: Arc<JobManager>,
    aggregator: Arc<ProgressAggregator>,
}

impl StepRouter {
    pub fn new(
        registry: Arc<StepExecutorRegistry>,
        jobs: Arc<JobManager>,
        aggregator: Arc<ProgressAggregator>,
    ) -> Self {
        Self {
            registry,
            jobs,
            aggregator,
        }
    }

    pub fn registry(&self) -> &Arc<StepExecutorRegistry> {
        &self.registry
    }

    fn executor_for(&self, step: &Step) -> JobResult<Arc<dyn StepExecutor>> {
        self.registry
            .get(&step.step_type)
            .ok_or_else(|| JobError::NoExecutor {
                step_type: step.step_type.clone(),
            })
    }

    /// Check that an executor exists for the step and accepts its config
    pub fn validate(&self, step: &Step) -> JobResult<()> {
        self.executor_for(step)?.validate(step)
    }

    /// Create the step job under `parent_job_id` and run its executor
    #[instrument(skip_all, fields(step_name = %step.name, step_type = %step.step_type, parent_job_id = %parent_job_id))]
    pub async fn route(
        &self,
        step: &Step,
        definition: &JobDefinition,
        parent_job_id: &str,
        cancel: &CancellationToken,
    ) -> JobResult<RoutedStep> {
        self.executor_for(step)?;
        let step_index = definition.step_index(&step.name).unwrap_or_default();

        let spec = JobSpec::new(step.name.clone())
            .with_metadata(meta::STEP_NAME, step.name.clone())
            .with_metadata(meta::STEP_TYPE, step.step_type.clone())
            .with_metadata(meta::STEP_INDEX, step_index)
            .with_metadata(meta::ON_ERROR, step.on_error.as_str())
            .with_metadata(fields::MANAGER_ID, parent_job_id)
            .with_metadata(meta::JOB_DEFINITION_ID, definition.id.clone())
            .with_config(step.config.clone());
        let step_job = self
            .jobs
            .create_job(JobKind::Step, Some(parent_job_id), spec)
            .await?;

        info!(step_job_id = %step_job.id, step_index, "Routing step");
        log_step_operation(
            "route",
            parent_job_id,
            Some(&step_job.id),
            &step.name,
            step_job.status.as_str(),
            Some(&step.step_type),
        );
        self.run(step, definition, step_job, cancel).await
    }

    /// Re-run the executor against an existing step job
    #[instrument(skip_all, fields(step_name = %step.name, step_job_id = %step_job_id))]
    pub async fn dispatch(
        &self,
        step: &Step,
        definition: &JobDefinition,
        step_job_id: &str,
        cancel: &CancellationToken,
    ) -> JobResult<RoutedStep> {
        let step_job = self.jobs.get_job(step_job_id).await?;
        self.run(step, definition, step_job, cancel).await
    }

    async fn run(
        &self,
        step: &Step,
        definition: &JobDefinition,
        step_job: Job,
        cancel: &CancellationToken,
    ) -> JobResult<RoutedStep> {
        let executor = self.executor_for(step)?;
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled {
                job_id: step_job.id.clone(),
            });
        }

        let manager_id = step_job.root_id().to_string();
        let outputs = self.collect_outputs(&manager_id).await?;
        let mut resolved = step.clone();
        resolved.config =
            placeholders::resolve(&step.config, &PlaceholderScope::new(&definition.variables, &outputs));

        self.jobs
            .increment_metadata_counter(&step_job.id, meta::ATTEMPTS, 1)
            .await?;
        self.jobs
            .update_status(&step_job.id, JobStatus::Running, None)
            .await?;

        let scope = self.jobs.cancellation_token(&step_job.id);
        let ctx = StepContext::new(Arc::clone(&self.jobs), &step_job, scope);
        let span = ctx.span().clone();
        let result = executor
            .create_jobs(ctx, &resolved, definition, &step_job.id)
            .instrument(span)
            .await;

        if let Err(err) = result {
            return Err(self.record_failure(step, &step_job, err).await);
        }

        if executor.returns_child_jobs() {
            self.aggregator.monitor(&step_job.id).await?;
            return Ok(RoutedStep {
                step_job_id: step_job.id,
                monitored: true,
            });
        }

        self.jobs
            .settle_status(&step_job.id, JobStatus::Completed, None)
            .await?;
        Ok(RoutedStep {
            step_job_id: step_job.id,
            monitored: false,
        })
    }

    async fn record_failure(&self, step: &Step, step_job: &Job, err: JobError) -> JobError {
        if matches!(err, JobError::Cancelled { .. }) {
            return err;
        }
        let message = match &err {
            JobError::Executor(inner) => inner.message.clone(),
            other => other.to_string(),
        };
        error!(step_job_id = %step_job.id, step_name = %step.name, error = %message, "Step executor failed");

        if let Err(record_err) = self.jobs.add_job_error(&step_job.id, &message).await {
            warn!(step_job_id = %step_job.id, error = %record_err, "Failed to record step error");
        }
        if let Err(log_err) = self
            .jobs
            .add_job_log(&step_job.id, LogLevel::Error, format!("Step failed: {message}"))
            .await
        {
            warn!(step_job_id = %step_job.id, error = %log_err, "Failed to log step error");
        }
        JobError::Executor(ExecutorError::new(&step.name, &step_job.id, message))
    }

    /// Outputs recorded by the manager's step jobs, keyed by step name
    async fn collect_outputs(&self, manager_id: &str) -> JobResult<HashMap<String, Map<String, Value>>> {
        let mut outputs = HashMap::new();
        for step_job in self.jobs.list_children(manager_id).await? {
            let Some(Value::Object(values)) = step_job.metadata.get(meta::OUTPUTS) else {
                continue;
            };
            if let Some(name) = step_job.step_name() {
                outputs.insert(name.to_string(), values.clone());
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use serde_json::json;

    /// Creates `count` workers and records the resolved `echo` config value
    struct EchoExecutor;

    #[async_trait]
    impl StepExecutor for EchoExecutor {
        fn step_type(&self) -> &str {
            "echo"
        }

        async fn create_jobs(
            &self,
            ctx: StepContext,
            step: &Step,
            _definition: &JobDefinition,
            _parent_job_id: &str,
        ) -> JobResult<()> {
            ctx.record_output("echo", step.config["echo"].clone()).await?;
            let count = step.config["count"].as_u64().unwrap_or(0);
            for i in 0..count {
                let worker = ctx.create_worker_job(JobSpec::new(format!("w{i}"))).await?;
                ctx.complete_worker(&worker.id).await?;
            }
            Ok(())
        }

        fn returns_child_jobs(&self) -> bool {
            true
        }
    }

    struct BrokenExecutor;

    #[async_trait]
    impl StepExecutor for BrokenExecutor {
        fn step_type(&self) -> &str {
            "broken"
        }

        fn validate(&self, step: &Step) -> JobResult<()> {
            if step.config.get("forbidden").is_some() {
                return Err(JobError::validation("forbidden key"));
            }
            Ok(())
        }

        async fn create_jobs(
            &self,
            _ctx: StepContext,
            _step: &Step,
            _definition: &JobDefinition,
            _parent_job_id: &str,
        ) -> JobResult<()> {
            Err(JobError::validation("upstream unavailable"))
        }

        fn returns_child_jobs(&self) -> bool {
            false
        }
    }

    async fn router() -> (StepRouter, Arc<JobManager>, Job) {
        let jobs = Arc::new(JobManager::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(EventBus::default()),
        ));
        let registry = StepExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor)).unwrap();
        registry.register(Arc::new(BrokenExecutor)).unwrap();
        let aggregator = Arc::new(ProgressAggregator::new(Arc::clone(&jobs)));
        let manager = jobs
            .create_job(JobKind::Manager, None, JobSpec::new("def"))
            .await
            .unwrap();
        (
            StepRouter::new(Arc::new(registry), Arc::clone(&jobs), aggregator),
            jobs,
            manager,
        )
    }

    #[tokio::test]
    async fn test_route_resolves_outputs_of_earlier_steps() {
        let (router, jobs, manager) = router().await;
        let first = Step::new("first", "echo").with_config(json!({"echo": "{greeting}", "count": 2}));
        let second = Step::new("second", "echo")
            .depends_on("first")
            .with_config(json!({"echo": "{first.echo}"}));
        let definition = JobDefinition::new("d", vec![first.clone(), second.clone()])
            .with_variable("greeting", "hello");
        let cancel = CancellationToken::new();

        let routed = router.route(&first, &definition, &manager.id, &cancel).await.unwrap();
        assert!(routed.monitored);
        let step_job = jobs.get_job(&routed.step_job_id).await.unwrap();
        assert_eq!(step_job.status, JobStatus::Completed);
        assert_eq!(step_job.metadata_str(meta::STEP_TYPE), Some("echo"));
        assert_eq!(step_job.metadata_i64(meta::STEP_INDEX), Some(0));

        let routed = router.route(&second, &definition, &manager.id, &cancel).await.unwrap();
        let step_job = jobs.get_job(&routed.step_job_id).await.unwrap();
        assert_eq!(step_job.metadata[meta::OUTPUTS]["echo"], json!("hello"));
    }

    #[tokio::test]
    async fn test_executor_failure_is_attributed_and_recorded() {
        let (router, jobs, manager) = router().await;
        let step = Step::new("flaky", "broken");
        let definition = JobDefinition::new("d", vec![step.clone()]);

        let err = router
            .route(&step, &definition, &manager.id, &CancellationToken::new())
            .await
            .unwrap_err();
        let executor_err = err.as_executor_error().unwrap().clone();
        assert_eq!(executor_err.step_name, "flaky");
        assert!(executor_err.message.contains("upstream unavailable"));

        let step_job = jobs.get_job(&executor_err.job_id).await.unwrap();
        assert_eq!(step_job.status, JobStatus::Running);
        assert_eq!(step_job.metadata_strings(meta::ERRORS).len(), 1);
    }

    #[tokio::test]
    async fn test_validate_and_missing_executor() {
        let (router, _, manager) = router().await;
        assert!(router.validate(&Step::new("a", "echo")).is_ok());
        assert!(matches!(
            router.validate(&Step::new("a", "broken").with_config(json!({"forbidden": 1}))),
            Err(JobError::Validation(_))
        ));

        let unknown = Step::new("a", "nope");
        let definition = JobDefinition::new("d", vec![unknown.clone()]);
        assert!(matches!(
            router.route(&unknown, &definition, &manager.id, &CancellationToken::new()).await,
            Err(JobError::NoExecutor { .. })
        ));
    }
}
