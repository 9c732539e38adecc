//! # Step Executor Registry
//!
//! Maps each step-type tag to exactly one [`StepExecutor`]. Duplicate registration is
//! rejected, so a misconfigured process fails at startup rather than mid-run.

use super::step_executor::StepExecutor;
use crate::error::RegistryError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_executors: usize,
    pub child_job_executors: usize,
    pub step_types: Vec<String>,
}

/// Thread-safe step-type dispatch table
#[derive(Default)]
pub struct StepExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn StepExecutor>>>,
}

impl fmt::Debug for StepExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutorRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

impl StepExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a fixed set of executors, failing on the first duplicate
    pub fn with_executors<I>(executors: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = Arc<dyn StepExecutor>>,
    {
        let registry = Self::new();
        for executor in executors {
            registry.register(executor)?;
        }
        Ok(registry)
    }

    /// Register an executor under its own type tag
    pub fn register(&self, executor: Arc<dyn StepExecutor>) -> Result<(), RegistryError> {
        let step_type = executor.step_type().trim().to_string();
        if step_type.is_empty() {
            return Err(RegistryError::EmptyTypeTag);
        }

        let mut executors = self.executors.write();
        if executors.contains_key(&step_type) {
            return Err(RegistryError::Duplicate { step_type });
        }

        info!(
            step_type = %step_type,
            returns_child_jobs = executor.returns_child_jobs(),
            "Registered step executor"
        );
        executors.insert(step_type, executor);
        Ok(())
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        let executor = self.executors.read().get(step_type).cloned();
        if executor.is_none() {
            debug!(step_type, "No step executor registered");
        }
        executor
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.read().contains_key(step_type)
    }

    /// Registered type tags, sorted
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn stats(&self) -> RegistryStats {
        let executors = self.executors.read();
        RegistryStats {
            total_executors: executors.len(),
            child_job_executors: executors.values().filter(|e| e.returns_child_jobs()).count(),
            step_types: {
                let mut types: Vec<String> = executors.keys().cloned().collect();
                types.sort();
                types
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobResult;
    use crate::models::{JobDefinition, Step};
    use crate::orchestration::context::StepContext;
    use async_trait::async_trait;

    struct NoopExecutor(&'static str);

    #[async_trait]
    impl StepExecutor for NoopExecutor {
        fn step_type(&self) -> &str {
            self.0
        }

        async fn create_jobs(
            &self,
            _ctx: StepContext,
            _step: &Step,
            _definition: &JobDefinition,
            _parent_job_id: &str,
        ) -> JobResult<()> {
            Ok(())
        }

        fn returns_child_jobs(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let registry = StepExecutorRegistry::new();
        registry.register(Arc::new(NoopExecutor("crawler"))).unwrap();

        let err = registry
            .register(Arc::new(NoopExecutor("crawler")))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Duplicate {
                step_type: "crawler".to_string()
            }
        );
    }

    #[test]
    fn test_empty_tag_is_rejected() {
        let registry = StepExecutorRegistry::new();
        assert_eq!(
            registry.register(Arc::new(NoopExecutor("  "))),
            Err(RegistryError::EmptyTypeTag)
        );
    }

    #[test]
    fn test_lookup_and_stats() {
        let registry = StepExecutorRegistry::with_executors([
            Arc::new(NoopExecutor("b")) as Arc<dyn StepExecutor>,
            Arc::new(NoopExecutor("a")),
        ])
        .unwrap();

        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.step_types(), vec!["a", "b"]);
        assert_eq!(registry.stats().total_executors, 2);
        assert_eq!(registry.stats().child_job_executors, 0);
    }
}
