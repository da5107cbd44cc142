//! Orchestrator configuration.
//!
//! Configuration is plain TOML. Every field has a default, so an empty file
//! (or no file at all) is a valid configuration.
//!
//! ```toml
//! max_concurrent_workflows = 10
//! default_workflow_timeout_secs = 3600
//! default_step_timeout_secs = 300
//! default_error_handling = "stop_on_error"
//!
//! [engine]
//! max_concurrent_steps = 4
//! default_retry_count = 2
//! ```

use crate::models::ErrorHandlingMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    Read(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Execution engine settings.
///
/// The timeout, error handling and logging fields are owned by
/// [`OrchestratorConfig`] and copied in by [`OrchestratorConfig::engine_config`];
/// they are not read from the `[engine]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Steps of one instance allowed to run at once.
    pub max_concurrent_steps: usize,
    /// Retries given to steps without their own policy under RetryOnError.
    pub default_retry_count: u32,
    /// Delay between those retries.
    pub default_retry_delay_ms: u64,
    /// How long cancelled steps get to wind down before they are aborted.
    pub cancellation_grace_ms: u64,
    /// Global cap on re-entries per feedback edge.
    pub max_feedback_iterations: u32,
    /// How long terminal statuses are kept.
    pub status_retention_secs: u64,
    /// Maximum number of terminal statuses kept.
    pub max_retained_statuses: usize,
    /// Timeout for steps that do not set one.
    #[serde(skip)]
    pub default_step_timeout_secs: u64,
    /// Timeout for workflows that do not set one.
    #[serde(skip)]
    pub default_workflow_timeout_secs: u64,
    /// Failure policy for workflows that do not set one.
    #[serde(skip)]
    pub default_error_handling: ErrorHandlingMode,
    /// Log per-step transitions at debug instead of trace.
    #[serde(skip)]
    pub detailed_logging: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4,
            default_retry_count: 2,
            default_retry_delay_ms: 1000,
            cancellation_grace_ms: 5000,
            max_feedback_iterations: 10,
            status_retention_secs: 3600,
            max_retained_statuses: 1000,
            default_step_timeout_secs: 300,
            default_workflow_timeout_secs: 3600,
            default_error_handling: ErrorHandlingMode::StopOnError,
            detailed_logging: false,
        }
    }
}

impl EngineConfig {
    /// Timeout for steps that do not set one.
    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    /// Timeout for workflows that do not set one.
    #[must_use]
    pub fn default_workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.default_workflow_timeout_secs)
    }

    /// Delay between default retries.
    #[must_use]
    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_millis(self.default_retry_delay_ms)
    }

    /// Grace period after cancellation.
    #[must_use]
    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    /// Retention period for terminal statuses.
    #[must_use]
    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_secs)
    }
}

/// Top level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Workflow instances allowed to run at once.
    pub max_concurrent_workflows: usize,
    /// Timeout for workflows that do not set one.
    pub default_workflow_timeout_secs: u64,
    /// Timeout for steps that do not set one.
    pub default_step_timeout_secs: u64,
    /// Log per-step transitions at debug level.
    pub enable_detailed_logging: bool,
    /// Record counters and timings.
    pub enable_metrics: bool,
    /// Validate definitions before executing them.
    pub validate_workflows: bool,
    /// Include per-step checks in validation.
    pub validate_steps: bool,
    /// Failure policy for workflows that do not set one.
    pub default_error_handling: ErrorHandlingMode,
    /// Engine settings.
    pub engine: EngineConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            default_workflow_timeout_secs: 3600,
            default_step_timeout_secs: 300,
            enable_detailed_logging: false,
            enable_metrics: true,
            validate_workflows: true,
            validate_steps: true,
            default_error_handling: ErrorHandlingMode::StopOnError,
            engine: EngineConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Rejects limits and timeouts that would make the engine unusable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_workflows == 0 {
            return Err(ConfigError::Invalid("max_concurrent_workflows must be > 0".to_string()));
        }
        if self.default_workflow_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "default_workflow_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.default_step_timeout_secs == 0 {
            return Err(ConfigError::Invalid("default_step_timeout_secs must be > 0".to_string()));
        }
        if self.engine.max_concurrent_steps == 0 {
            return Err(ConfigError::Invalid("engine.max_concurrent_steps must be > 0".to_string()));
        }
        if self.engine.max_retained_statuses == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_retained_statuses must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Engine settings with the orchestrator-owned defaults applied.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_step_timeout_secs: self.default_step_timeout_secs,
            default_workflow_timeout_secs: self.default_workflow_timeout_secs,
            default_error_handling: self.default_error_handling,
            detailed_logging: self.enable_detailed_logging,
            ..self.engine.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_workflows, 10);
        assert_eq!(config.engine.max_concurrent_steps, 4);
        assert!(config.validate_workflows);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            max_concurrent_workflows = 2
            default_error_handling = "continue_on_error"

            [engine]
            max_concurrent_steps = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_workflows, 2);
        assert_eq!(config.default_error_handling, ErrorHandlingMode::ContinueOnError);
        assert_eq!(config.engine.max_concurrent_steps, 8);
        assert_eq!(config.engine.default_retry_count, 2);
        assert_eq!(config.default_step_timeout_secs, 300);
    }

    #[test]
    fn test_engine_config_propagates_defaults() {
        let mut config = OrchestratorConfig::default();
        config.default_step_timeout_secs = 7;
        config.default_error_handling = ErrorHandlingMode::RetryOnError;
        config.enable_detailed_logging = true;

        let engine = config.engine_config();
        assert_eq!(engine.default_step_timeout(), Duration::from_secs(7));
        assert_eq!(engine.default_error_handling, ErrorHandlingMode::RetryOnError);
        assert!(engine.detailed_logging);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = OrchestratorConfig::default();
        config.max_concurrent_workflows = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = OrchestratorConfig::default();
        config.engine.max_concurrent_steps = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "default_step_timeout_secs = 12").unwrap();
        let config = OrchestratorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.default_step_timeout_secs, 12);
    }

    #[test]
    fn test_load_missing_and_malformed() {
        let missing = OrchestratorConfig::load_from_file(Path::new("/definitely/not/here.toml"));
        assert!(matches!(missing, Err(ConfigError::NotFound(_))));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent_workflows = \"many\"").unwrap();
        let malformed = OrchestratorConfig::load_from_file(file.path());
        assert!(matches!(malformed, Err(ConfigError::Parse(_))));
    }
}
