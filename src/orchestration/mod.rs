//! # Orchestration Engine
//!
//! Turns job definitions into trees of persisted jobs and keeps those trees moving.
//!
//! ## Core Components
//!
//! - **JobManager**: job record lifecycle (create, status, metadata, logs, cancellation)
//! - **StepRouter**: resolves a step's executor, creates the step job, invokes the executor
//! - **Orchestrator**: validates a definition and drives its steps in dependency waves
//! - **ProgressAggregator**: level-triggered parent summaries and finalization
//! - **OrchestrationBootstrap**: wires all of the above from configuration
//!
//! ## Job hierarchy
//!
//! ```text
//! manager (one per definition run)
//!   └── step (one per routed step)
//!         └── worker (created by the step's executor)
//! ```

pub mod bootstrap;
pub mod context;
pub mod job_manager;
pub mod orchestrator;
pub mod placeholders;
pub mod plan;
pub mod progress_aggregator;
pub mod step_router;

pub use bootstrap::{OrchestrationBootstrap, OrchestrationSystem, SystemStatus};
pub use context::StepContext;
pub use job_manager::{JobManager, StatusUpdate};
pub use orchestrator::Orchestrator;
pub use plan::ExecutionPlan;
pub use progress_aggregator::{derive_overall_status, ProgressAggregator};
pub use step_router::{RoutedStep, StepRouter};
