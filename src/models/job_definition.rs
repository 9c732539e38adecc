//! # Job Definitions
//!
//! Immutable templates produced by an external loader and consumed by the
//! [`Orchestrator`](crate::orchestration::Orchestrator). The core never mutates a
//! definition; placeholder resolution produces a resolved copy of a [`Step`].

use crate::utils::serde::deserialize_string_list;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Per-step policy applied when the step's executor or its children fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Record the error on the step job and keep running independent steps
    Continue,
    /// Abort remaining steps and fail the manager job
    #[default]
    Fail,
    /// Re-dispatch the step a bounded number of times, then fall back to `Fail`
    Retry,
}

impl OnError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Fail => "fail",
            Self::Retry => "retry",
        }
    }

    /// Whether failed children of a step with this policy leave its parent `completed`
    pub fn tolerates_failures(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(Self::Continue),
            "fail" => Ok(Self::Fail),
            "retry" => Ok(Self::Retry),
            _ => Err(format!("Invalid on_error policy: {s}")),
        }
    }
}

/// What happens once a manager accumulates `max_child_failures` failed workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Fail the manager and cancel its still-running descendants
    StopAll,
    #[default]
    Continue,
    /// Record a warning on the manager job
    MarkWarning,
}

/// Definition-wide failure threshold applied to the manager job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorTolerance {
    /// Number of failed worker jobs that triggers `failure_action` (0 = unlimited)
    #[serde(default)]
    pub max_child_failures: u32,
    #[serde(default)]
    pub failure_action: FailureAction,
}

impl ErrorTolerance {
    /// Whether `failed` worker failures crosses the threshold
    pub fn is_exceeded(&self, failed: u64) -> bool {
        self.max_child_failures > 0 && failed >= u64::from(self.max_child_failures)
    }
}

/// One step of a job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(
        default,
        alias = "depends",
        deserialize_with = "deserialize_string_list"
    )]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque payload interpreted only by the matching executor
    #[serde(default)]
    pub config: Value,
}

impl Step {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            on_error: OnError::default(),
            depends_on: Vec::new(),
            description: None,
            config: Value::Object(Map::new()),
        }
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn depends_on(mut self, step_name: impl Into<String>) -> Self {
        self.depends_on.push(step_name.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Immutable template describing an ordered set of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    /// Source for `{key}` placeholders in step config
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_tolerance: Option<ErrorTolerance>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            steps,
            variables: Map::new(),
            error_tolerance: None,
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_error_tolerance(mut self, tolerance: ErrorTolerance) -> Self {
        self.error_tolerance = Some(tolerance);
        self
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Structural checks: non-empty id and steps, unique step names, known dependencies.
    ///
    /// Cycle detection lives with the execution plan, see
    /// [`ExecutionPlan`](crate::orchestration::plan::ExecutionPlan).
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("job definition id must not be empty".to_string());
        }
        if self.steps.is_empty() {
            return Err(format!("job definition '{}' has no steps", self.id));
        }

        let mut names = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(format!("job definition '{}' has a step without a name", self.id));
            }
            if step.step_type.trim().is_empty() {
                return Err(format!("step '{}' has no type", step.name));
            }
            if !names.insert(step.name.as_str()) {
                return Err(format!("duplicate step name '{}'", step.name));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.name {
                    return Err(format!("step '{}' depends on itself", step.name));
                }
                if !names.contains(dep.as_str()) {
                    return Err(format!(
                        "step '{}' depends on unknown step '{dep}'",
                        step.name
                    ));
                }
            }
        }

        Ok(())
    }
}
