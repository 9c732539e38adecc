//! Step executors used by the integration tests.

use async_trait::async_trait;
use jobtree_core::error::{ExecutorError, JobResult};
use jobtree_core::models::{JobDefinition, JobSpec, LogLevel, Step};
use jobtree_core::orchestration::StepContext;
use jobtree_core::registry::StepExecutor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Creates `config.count` workers and finishes each one, failing the indices listed
/// in `config.fail`. Records `count` and the resolved `config.echo` as outputs.
pub struct EchoExecutor;

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
        let count = step.config["count"].as_u64().unwrap_or(1);
        let fail: Vec<u64> = step.config["fail"]
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_u64()).collect())
            .unwrap_or_default();

        ctx.record_output("count", count).await?;
        if let Some(echo) = step.config.get("echo") {
            ctx.record_output("echo", echo.clone()).await?;
        }

        let mut workers = Vec::new();
        for i in 0..count {
            let worker = ctx
                .create_worker_job(JobSpec::new(format!("{}-{i}", step.name)).with_job_type("echo_worker"))
                .await?;
            workers.push((i, worker.id));
        }
        ctx.log(LogLevel::Info, format!("Created {count} workers")).await?;

        // Finish workers in the background so status changes race with routing
        tokio::spawn(async move {
            for (i, worker_id) in workers {
                tokio::time::sleep(Duration::from_millis(2)).await;
                let _ = ctx.start_worker(&worker_id).await;
                if fail.contains(&i) {
                    let _ = ctx.fail_worker(&worker_id, format!("worker {i} failed")).await;
                } else {
                    let _ = ctx.add_documents(1).await;
                    let _ = ctx.complete_worker(&worker_id).await;
                }
            }
        });
        Ok(())
    }

    fn returns_child_jobs(&self) -> bool {
        true
    }
}

/// Fails until it has been invoked `succeed_on` times (never, when unset)
#[derive(Default)]
pub struct FailingExecutor {
    pub attempts: Arc<AtomicU32>,
}

#[async_trait]
impl StepExecutor for FailingExecutor {
    fn step_type(&self) -> &str {
        "failing"
    }

    async fn create_jobs(
        &self,
        ctx: StepContext,
        step: &Step,
        _definition: &JobDefinition,
        _parent_job_id: &str,
    ) -> JobResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let succeed_on = step.config["succeed_on"].as_u64().unwrap_or(u64::MAX);
        if u64::from(attempt) >= succeed_on {
            ctx.record_output("attempt", attempt).await?;
            return Ok(());
        }
        Err(ExecutorError::new(
            ctx.step_name(),
            ctx.step_job_id(),
            format!("upstream unavailable (attempt {attempt})"),
        )
        .into())
    }

    fn returns_child_jobs(&self) -> bool {
        false
    }
}

/// Creates `config.count` workers that only stop when the tree is cancelled. The first
/// `config.complete` of them finish right away; `config.start = false` leaves the rest
/// pending instead of running.
pub struct BlockingExecutor;

#[async_trait]
impl StepExecutor for BlockingExecutor {
    fn step_type(&self) -> &str {
        "blocking"
    }

    async fn create_jobs(
        &self,
        ctx: StepContext,
        step: &Step,
        _definition: &JobDefinition,
        _parent_job_id: &str,
    ) -> JobResult<()> {
        let count = step.config["count"].as_u64().unwrap_or(2);
        let complete = step.config["complete"].as_u64().unwrap_or(0);
        let start = step.config["start"].as_bool().unwrap_or(true);
        for i in 0..count {
            let worker = ctx
                .create_worker_job(JobSpec::new(format!("blocked-{i}")))
                .await?;
            if i < complete {
                ctx.start_worker(&worker.id).await?;
                ctx.complete_worker(&worker.id).await?;
            } else if start {
                ctx.start_worker(&worker.id).await?;
            }
        }
        Ok(())
    }

    fn returns_child_jobs(&self) -> bool {
        true
    }
}

/// Completes immediately without creating workers
pub struct NoopExecutor;

#[async_trait]
impl StepExecutor for NoopExecutor {
    fn step_type(&self) -> &str {
        "noop"
    }

    async fn create_jobs(
        &self,
        ctx: StepContext,
        _step: &Step,
        _definition: &JobDefinition,
        _parent_job_id: &str,
    ) -> JobResult<()> {
        ctx.log(LogLevel::Debug, "nothing to do").await?;
        Ok(())
    }

    fn returns_child_jobs(&self) -> bool {
        false
    }
}
