// Error types for the agent layer

use thiserror::Error;

/// Result type for agent layer operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent layer errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// An agent with the same id is already registered
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(String),

    /// The safety validator rejected the task
    #[error("Task rejected by safety validator: {0}")]
    UnsafeTask(String),

    /// No registered agent satisfies the requirements
    #[error("No suitable agent found: {0}")]
    NoSuitableAgent(String),
}
