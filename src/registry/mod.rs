//! # Registry Module
//!
//! Step-type dispatch: the [`StepExecutor`] interface implemented by external executors
//! and the [`StepExecutorRegistry`] the step router resolves them from.

pub mod executor_registry;
pub mod step_executor;

pub use executor_registry::{RegistryStats, StepExecutorRegistry};
pub use step_executor::StepExecutor;
