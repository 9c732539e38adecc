//! # Step Executor Interface
//!
//! Implemented by the components that know how to perform one step type (crawling,
//! agent calls, API collection). The core only defines and invokes this interface.

use crate::error::JobResult;
use crate::models::{JobDefinition, Step};
use crate::orchestration::context::StepContext;
use async_trait::async_trait;

/// Performs the work of one step type.
///
/// `create_jobs` materializes the step's worker jobs through
/// [`StepContext::create_worker_job`]. Executors that return `true` from
/// [`returns_child_jobs`](Self::returns_child_jobs) leave their step job running until
/// every worker job is terminal; the others have their step job completed as soon as
/// `create_jobs` returns.
///
/// Long-running executors should check [`StepContext::is_cancelled`] between units of
/// work and stop creating worker jobs once the tree is cancelled.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Unique step-type tag this executor handles
    fn step_type(&self) -> &str;

    /// Reject a step whose config this executor cannot run
    fn validate(&self, _step: &Step) -> JobResult<()> {
        Ok(())
    }

    async fn create_jobs(
        &self,
        ctx: StepContext,
        step: &Step,
        definition: &JobDefinition,
        parent_job_id: &str,
    ) -> JobResult<()>;

    /// Whether the step job should be monitored as a parent of worker jobs
    fn returns_child_jobs(&self) -> bool;
}
