//! # Job Record
//!
//! The mutable, persisted unit of work. Every job belongs to a three-tier tree:
//! one **manager** job per job-definition execution, one **step** job per step, and
//! zero or more **worker** jobs created by step executors.
//!
//! Context the UI and aggregator need (parent, manager, step name, error policy) is
//! written onto the record when it is created, so nothing has to be reconstructed by
//! walking the parent chain later.

use crate::constants::{job_types, metadata as meta};
use crate::models::job_definition::OnError;
use crate::state_machine::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Position of a job in the manager/step/worker hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Manager,
    Step,
    Worker,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manager => "manager",
            Self::Step => "step",
            Self::Worker => "worker",
        }
    }

    /// Kind the parent of a job of this kind must have (`None` for roots)
    pub fn required_parent_kind(&self) -> Option<JobKind> {
        match self {
            Self::Manager => None,
            Self::Step => Some(Self::Manager),
            Self::Worker => Some(Self::Step),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied description of a job to create
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    /// Type tag; defaults to the kind name
    pub job_type: Option<String>,
    pub metadata: Map<String, Value>,
    pub config: Value,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// Persisted job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub parent_id: Option<String>,
    /// Root manager of the tree; `None` only for manager jobs
    pub manager_id: Option<String>,
    pub kind: JobKind,
    pub job_type: String,
    pub name: String,
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Optimistic concurrency counter, bumped on every committed write
    #[serde(default)]
    pub version: u64,
}

impl Job {
    /// Build a new `pending` record. `parent` must already be validated by the caller.
    pub fn new(kind: JobKind, spec: JobSpec, parent: Option<&Job>) -> Self {
        let now = Utc::now();
        let job_type = spec.job_type.unwrap_or_else(|| match kind {
            JobKind::Manager => job_types::MANAGER.to_string(),
            JobKind::Step => job_types::STEP.to_string(),
            JobKind::Worker => kind.as_str().to_string(),
        });
        let manager_id = parent.map(|p| p.manager_id.clone().unwrap_or_else(|| p.id.clone()));

        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: parent.map(|p| p.id.clone()),
            manager_id,
            kind,
            job_type,
            name: spec.name,
            status: JobStatus::Pending,
            metadata: spec.metadata,
            config: spec.config,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            version: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Id of the manager job at the root of this job's tree (itself for managers)
    pub fn root_id(&self) -> &str {
        self.manager_id.as_deref().unwrap_or(&self.id)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn metadata_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(Value::as_i64)
    }

    /// Step name tag recorded at creation (steps carry it, workers inherit it)
    pub fn step_name(&self) -> Option<&str> {
        self.metadata_str(meta::STEP_NAME)
    }

    /// Error policy recorded on step jobs; other jobs report the default
    pub fn on_error(&self) -> OnError {
        self.metadata_str(meta::ON_ERROR)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn document_count(&self) -> i64 {
        self.metadata_i64(meta::DOCUMENT_COUNT).unwrap_or(0)
    }

    /// String list stored under `key` (used for `errors` / `warnings`)
    pub fn metadata_strings(&self, key: &str) -> Vec<String> {
        self.metadata
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Shallow merge: keys in `patch` replace existing keys
    pub fn merge_metadata(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.metadata.insert(key, value);
        }
    }

    /// Apply an already-validated status change and its timestamps
    pub(crate) fn apply_status(&mut self, status: JobStatus, error: Option<String>) {
        let now = Utc::now();
        if status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.finished_at = Some(now);
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = status;
        self.updated_at = now;
    }
}
