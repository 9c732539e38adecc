//! Payload builders for the topics the core publishes.
//!
//! Field names are part of the observer contract (see [`crate::constants::fields`]).
//! Timestamps are RFC 3339 strings with microsecond precision.

use crate::constants::{events as topics, fields};
use crate::events::Event;
use crate::models::{ChildStats, Job, JobLogEntry};
use crate::state_machine::JobStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn optional(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |v| Value::String(v.to_string()))
}

/// `job.status_changed` for the committed record
pub fn status_changed(job: &Job, timestamp: DateTime<Utc>) -> Event {
    let mut payload = Map::new();
    payload.insert(fields::JOB_ID.into(), job.id.clone().into());
    payload.insert(fields::STATUS.into(), job.status.as_str().into());
    payload.insert(fields::JOB_TYPE.into(), job.job_type.clone().into());
    payload.insert(fields::JOB_KIND.into(), job.kind.as_str().into());
    payload.insert(fields::PARENT_ID.into(), optional(job.parent_id.as_deref()));
    payload.insert(fields::MANAGER_ID.into(), optional(job.manager_id.as_deref()));
    payload.insert(fields::STEP_NAME.into(), optional(job.step_name()));
    payload.insert(fields::DOCUMENT_COUNT.into(), job.document_count().into());
    if let Some(error) = &job.error {
        payload.insert(fields::ERROR.into(), error.clone().into());
    }
    payload.insert(fields::TIMESTAMP.into(), format_timestamp(timestamp).into());
    Event::new(topics::JOB_STATUS_CHANGED, payload)
}

/// Lifecycle topic matching a terminal status, if any
pub fn lifecycle(job: &Job, timestamp: DateTime<Utc>) -> Option<Event> {
    let topic = match job.status {
        JobStatus::Completed => topics::JOB_COMPLETED,
        JobStatus::Failed => topics::JOB_FAILED,
        JobStatus::Cancelled => topics::JOB_CANCELLED,
        JobStatus::Pending | JobStatus::Running => return None,
    };
    let mut event = status_changed(job, timestamp);
    event.event_type = topic.to_string();
    Some(event)
}

/// Aggregated view of a parent job published by the progress aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub stats: ChildStats,
    pub document_count: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ProgressSnapshot {
    fn into_payload(self, timestamp: DateTime<Utc>) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert(fields::JOB_ID.into(), self.job_id.into());
        payload.insert(fields::STATUS.into(), self.status.as_str().into());
        payload.insert(fields::PENDING_CHILDREN.into(), self.stats.pending.into());
        payload.insert(fields::RUNNING_CHILDREN.into(), self.stats.running.into());
        payload.insert(fields::COMPLETED_CHILDREN.into(), self.stats.completed.into());
        payload.insert(fields::FAILED_CHILDREN.into(), self.stats.failed.into());
        payload.insert(fields::CANCELLED_CHILDREN.into(), self.stats.cancelled.into());
        payload.insert(fields::TOTAL_CHILDREN.into(), self.stats.total.into());
        payload.insert(
            fields::PROGRESS_TEXT.into(),
            self.stats.progress_text().into(),
        );
        payload.insert(fields::DOCUMENT_COUNT.into(), self.document_count.into());
        payload.insert(fields::ERRORS.into(), self.errors.into());
        payload.insert(fields::WARNINGS.into(), self.warnings.into());
        payload.insert(fields::TIMESTAMP.into(), format_timestamp(timestamp).into());
        payload
    }
}

/// `job.progress`
pub fn progress(snapshot: ProgressSnapshot, timestamp: DateTime<Utc>) -> Event {
    Event::new(topics::JOB_PROGRESS, snapshot.into_payload(timestamp))
}

/// `job.step_progress`: a step's own histogram, tagged with its manager and name
pub fn step_progress(step: &Job, snapshot: ProgressSnapshot, timestamp: DateTime<Utc>) -> Event {
    let mut payload = snapshot.into_payload(timestamp);
    payload.insert(fields::STEP_ID.into(), step.id.clone().into());
    payload.insert(fields::STEP_NAME.into(), optional(step.step_name()));
    payload.insert(fields::MANAGER_ID.into(), optional(step.manager_id.as_deref()));
    Event::new(topics::JOB_STEP_PROGRESS, payload)
}

/// `job.log`
pub fn log(entry: &JobLogEntry) -> Event {
    let mut payload = Map::new();
    payload.insert(fields::JOB_ID.into(), entry.job_id.clone().into());
    payload.insert(fields::LEVEL.into(), entry.level.as_str().into());
    payload.insert(fields::MESSAGE.into(), entry.message.clone().into());
    payload.insert(fields::TIMESTAMP.into(), format_timestamp(entry.timestamp).into());
    if let Some(step_name) = &entry.step_name {
        payload.insert(fields::STEP_NAME.into(), step_name.clone().into());
    }
    if let Some(manager_id) = &entry.manager_id {
        payload.insert(fields::MANAGER_ID.into(), manager_id.clone().into());
    }
    Event::new(topics::JOB_LOG, payload)
}
