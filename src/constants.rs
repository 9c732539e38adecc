//! # System Constants
//!
//! Event topics, payload field names and metadata keys shared by the job manager,
//! progress aggregator and transport layer. Payload field names are part of the
//! observer contract and must not be renamed.

/// Event bus topics produced and consumed by the core
pub mod events {
    pub const JOB_STATUS_CHANGED: &str = "job.status_changed";
    pub const JOB_PROGRESS: &str = "job.progress";
    pub const JOB_STEP_PROGRESS: &str = "job.step_progress";
    pub const JOB_LOG: &str = "job.log";

    // Lifecycle topics published alongside a terminal status change
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const JOB_CANCELLED: &str = "job.cancelled";

    /// Topics forwarded verbatim to real-time observers
    pub const TRANSPORT_TOPICS: &[&str] =
        &[JOB_PROGRESS, JOB_STEP_PROGRESS, JOB_LOG, JOB_STATUS_CHANGED];
}

/// Payload field names
pub mod fields {
    pub const JOB_ID: &str = "job_id";
    pub const STATUS: &str = "status";
    pub const JOB_TYPE: &str = "job_type";
    pub const JOB_KIND: &str = "job_kind";
    pub const PARENT_ID: &str = "parent_id";
    pub const MANAGER_ID: &str = "manager_id";
    pub const STEP_ID: &str = "step_id";
    pub const STEP_NAME: &str = "step_name";
    pub const TIMESTAMP: &str = "timestamp";
    pub const ERROR: &str = "error";

    pub const PENDING_CHILDREN: &str = "pending_children";
    pub const RUNNING_CHILDREN: &str = "running_children";
    pub const COMPLETED_CHILDREN: &str = "completed_children";
    pub const FAILED_CHILDREN: &str = "failed_children";
    pub const CANCELLED_CHILDREN: &str = "cancelled_children";
    pub const TOTAL_CHILDREN: &str = "total_children";
    pub const PROGRESS_TEXT: &str = "progress_text";
    pub const DOCUMENT_COUNT: &str = "document_count";
    pub const ERRORS: &str = "errors";
    pub const WARNINGS: &str = "warnings";

    pub const LEVEL: &str = "level";
    pub const MESSAGE: &str = "message";
}

/// Job metadata keys written by the core
pub mod metadata {
    pub const JOB_DEFINITION_ID: &str = "job_definition_id";
    pub const JOB_DEFINITION_NAME: &str = "job_definition_name";
    pub const STEP_DEFINITIONS: &str = "step_definitions";
    pub const TOTAL_STEPS: &str = "total_steps";
    pub const CURRENT_STEP: &str = "current_step";
    pub const CURRENT_STEP_NAME: &str = "current_step_name";
    pub const COMPLETED_STEPS: &str = "completed_steps";
    pub const STEP_STATS: &str = "step_stats";
    pub const STEP_JOB_IDS: &str = "step_job_ids";
    pub const ERROR_TOLERANCE: &str = "error_tolerance";

    pub const STEP_NAME: &str = "step_name";
    pub const STEP_TYPE: &str = "step_type";
    pub const STEP_INDEX: &str = "step_index";
    pub const ON_ERROR: &str = "on_error";
    pub const ATTEMPTS: &str = "attempts";
    pub const OUTPUTS: &str = "outputs";

    pub const CHILD_STATS: &str = "child_stats";
    pub const FAILED_CHILDREN: &str = "failed_children";
    pub const FAILED_STEPS: &str = "failed_steps";
    pub const COMPLETED_WITH_ERRORS: &str = "completed_with_errors";
    pub const DOCUMENT_COUNT: &str = "document_count";
    pub const ERRORS: &str = "errors";
    pub const WARNINGS: &str = "warnings";
}

/// Job type tags for non-worker jobs
pub mod job_types {
    pub const MANAGER: &str = "manager";
    pub const STEP: &str = "step";
}
