//! # Structured Logging Module
//!
//! Environment-aware structured logging for the async orchestration core. Console
//! output is human readable by default; set `JOBTREE_LOG_FORMAT=json` (or
//! `logging.json = true` in the config) for one JSON object per line.

use crate::config::LoggingConfig;
use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging from the environment
pub fn init_structured_logging() {
    let json = std::env::var("JOBTREE_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    init_with(&LoggingConfig {
        level: None,
        json,
    });
}

/// Initialize structured logging from an explicit config section
pub fn init_with(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = build_filter(config.level.as_deref(), &environment);

        let layer = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json = config.json,
            "Structured logging initialized"
        );
    });
}

/// `RUST_LOG` wins, then the configured level, then the environment default
fn build_filter(configured: Option<&str>, environment: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = configured
        .map(str::to_string)
        .unwrap_or_else(|| get_log_level(environment));
    EnvFilter::new(level)
}

/// Get current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("JOBTREE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for job operations
pub fn log_job_operation(
    operation: &str,
    job_id: &str,
    job_kind: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        job_id = %job_id,
        job_kind = %job_kind,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "JOB_OPERATION"
    );
}

/// Log structured data for step operations
pub fn log_step_operation(
    operation: &str,
    manager_id: &str,
    step_job_id: Option<&str>,
    step_name: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        manager_id = %manager_id,
        step_job_id = step_job_id,
        step_name = %step_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "STEP_OPERATION"
    );
}

/// Log errors with structured context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
