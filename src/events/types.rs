use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::constants::events as topics;

/// Message carried by the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Topic string, e.g. `job.status_changed`
    pub event_type: String,
    pub payload: Map<String, Value>,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            published_at: Utc::now(),
        }
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    pub fn u64_field(&self, field: &str) -> Option<u64> {
        self.payload.get(field).and_then(Value::as_u64)
    }

    pub fn job_id(&self) -> Option<&str> {
        self.str_field(crate::constants::fields::JOB_ID)
    }

    /// Parent id, treating a missing, null or empty value as absent
    pub fn parent_id(&self) -> Option<&str> {
        self.str_field(crate::constants::fields::PARENT_ID)
            .filter(|id| !id.is_empty())
    }
}
