//! Configuration Loader
//!
//! Layers an optional TOML/YAML/JSON file (format inferred from the extension) under
//! `JOBTREE__`-prefixed environment variables, e.g.
//! `JOBTREE__ORCHESTRATION__STEP_RETRY_ATTEMPTS=5`.

use super::error::ConfigResult;
use super::JobtreeConfig;
use config::{Config, Environment, File};
use std::path::Path;
use tracing::debug;

pub const ENV_PREFIX: &str = "JOBTREE";
pub const ENV_SEPARATOR: &str = "__";

fn environment_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}

/// Load from `path` (if it exists) with environment overrides, then validate
pub fn load_from_path(path: &Path) -> ConfigResult<JobtreeConfig> {
    debug!(path = %path.display(), "Loading configuration");
    let config: JobtreeConfig = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(environment_source())
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Load from environment variables only, then validate
pub fn load_from_env() -> ConfigResult<JobtreeConfig> {
    let config: JobtreeConfig = Config::builder()
        .add_source(environment_source())
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}
