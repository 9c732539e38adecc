//! Dependency waves for a job definition.
//!
//! A wave is the set of steps whose `depends_on` are all satisfied by earlier waves.
//! Steps inside a wave keep their definition order.

use crate::error::{JobError, JobResult};
use crate::models::JobDefinition;
use std::collections::HashMap;

/// Validated execution order for a definition's steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Step indices grouped into dependency waves
    waves: Vec<Vec<usize>>,
}

impl ExecutionPlan {
    /// Build the wave order, rejecting dependency cycles.
    ///
    /// Assumes [`JobDefinition::validate`] already passed, so every dependency names an
    /// existing step.
    pub fn build(definition: &JobDefinition) -> JobResult<Self> {
        let index: HashMap<&str, usize> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.name.as_str(), i))
            .collect();

        let mut remaining: Vec<usize> = definition
            .steps
            .iter()
            .map(|step| step.depends_on.len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definition.steps.len()];
        for (i, step) in definition.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                let Some(&dep) = index.get(dependency.as_str()) else {
                    return Err(JobError::validation(format!(
                        "step '{}' depends on unknown step '{dependency}'",
                        step.name
                    )));
                };
                dependents[dep].push(i);
            }
        }

        let mut waves = Vec::new();
        let mut ready: Vec<usize> = (0..remaining.len()).filter(|&i| remaining[i] == 0).collect();
        let mut placed = 0;
        while !ready.is_empty() {
            placed += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &dependent in &dependents[i] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            waves.push(std::mem::replace(&mut ready, next));
        }

        if placed < definition.steps.len() {
            let mut cyclic: Vec<&str> = remaining
                .iter()
                .enumerate()
                .filter(|(_, &left)| left > 0)
                .map(|(i, _)| definition.steps[i].name.as_str())
                .collect();
            cyclic.sort_unstable();
            return Err(JobError::validation(format!(
                "dependency cycle between steps: {}",
                cyclic.join(", ")
            )));
        }

        Ok(Self { waves })
    }

    pub fn waves(&self) -> &[Vec<usize>] {
        &self.waves
    }

    pub fn step_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }
}
