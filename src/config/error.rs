use crate::error::JobError;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigurationError> for JobError {
    fn from(err: ConfigurationError) -> Self {
        JobError::Configuration(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
