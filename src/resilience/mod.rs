//! # Resilience Module
//!
//! Retry timing shared by the store's contention retries and the orchestrator's
//! `retry` step policy.

pub mod backoff;

pub use backoff::BackoffPolicy;
