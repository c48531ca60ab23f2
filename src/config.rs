//! Core configuration for the pipeline execution core.
//!
//! Provides configuration for the flow root, control-plane database,
//! cluster backend, and dispatch concurrency, with environment-variable
//! overrides.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the execution core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root directory holding per-execution working directories and
    /// result store files.
    pub flow_root: PathBuf,
    /// Path of the control-plane database file.
    pub control_plane_path: PathBuf,
    /// Base URL of the cluster backend; `None` forces in-process
    /// dispatch for every task.
    pub cluster_base_url: Option<String>,
    /// Maximum Samples processed concurrently by the in-process
    /// dispatcher.
    pub max_concurrent_samples: usize,
    /// Default execution timeout for tasks that carry none.
    pub default_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            flow_root: PathBuf::from("./flow"),
            control_plane_path: PathBuf::from("./flow/control.db"),
            cluster_base_url: None,
            max_concurrent_samples: 4,
            default_timeout: Duration::from_secs(3600),
        }
    }
}

impl CoreConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flow root directory.
    pub fn with_flow_root(mut self, flow_root: impl Into<PathBuf>) -> Self {
        self.flow_root = flow_root.into();
        self.control_plane_path = self.flow_root.join("control.db");
        self
    }

    /// Sets the control-plane database path.
    pub fn with_control_plane_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_plane_path = path.into();
        self
    }

    /// Sets the cluster backend base URL.
    pub fn with_cluster_base_url(mut self, url: impl Into<String>) -> Self {
        self.cluster_base_url = Some(url.into());
        self
    }

    /// Sets the dispatch concurrency cap.
    pub fn with_max_concurrent_samples(mut self, max: usize) -> Self {
        self.max_concurrent_samples = max;
        self
    }

    /// Sets the default execution timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PREPFORGE_FLOW_ROOT`: flow root directory (default: ./flow)
    /// - `PREPFORGE_CONTROL_PLANE`: control-plane db path (default: <flow_root>/control.db)
    /// - `PREPFORGE_CLUSTER_URL`: cluster backend base URL (optional)
    /// - `PREPFORGE_MAX_CONCURRENT_SAMPLES`: dispatch concurrency (default: 4)
    /// - `PREPFORGE_DEFAULT_TIMEOUT_SECS`: default task timeout (default: 3600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PREPFORGE_FLOW_ROOT") {
            config = config.with_flow_root(val);
        }

        if let Ok(val) = std::env::var("PREPFORGE_CONTROL_PLANE") {
            config.control_plane_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PREPFORGE_CLUSTER_URL") {
            config.cluster_base_url = Some(val);
        }

        if let Ok(val) = std::env::var("PREPFORGE_MAX_CONCURRENT_SAMPLES") {
            config.max_concurrent_samples = parse_env_value(&val, "PREPFORGE_MAX_CONCURRENT_SAMPLES")?;
        }

        if let Ok(val) = std::env::var("PREPFORGE_DEFAULT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PREPFORGE_DEFAULT_TIMEOUT_SECS")?;
            config.default_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_samples == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_samples must be at least 1".to_string(),
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_timeout must be positive".to_string(),
            ));
        }
        if let Some(url) = &self.cluster_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::ValidationFailed(format!(
                    "cluster_base_url must be an HTTP URL, got '{url}'"
                )));
            }
        }
        Ok(())
    }
}

/// Parses a typed value from an environment variable string.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
