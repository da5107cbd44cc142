//! Error types for the orchestrator.

use crate::config::ConfigError;
use crate::workflow::ValidationError;
use maestro_agents::AgentError;
use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Registry or task selection error.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The workflow definition is malformed.
    #[error("Workflow validation failed: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    /// No instance with this id is known.
    #[error("Workflow instance not found: {0}")]
    WorkflowNotFound(String),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_problem() {
        let err = OrchestratorError::Validation(vec![
            ValidationError::EmptyName,
            ValidationError::NoSteps,
        ]);
        let message = err.to_string();
        assert!(message.starts_with("Workflow validation failed: "));
        assert!(message.contains("; "));
    }

    #[test]
    fn test_agent_error_converts() {
        let err: OrchestratorError = AgentError::DuplicateAgent("a1".into()).into();
        assert_eq!(err.to_string(), "Agent 'a1' is already registered");
    }
}
