//! Final outcome of a workflow run.

use crate::models::status::{StepState, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The definition failed validation.
    ValidationFailed,
    /// No registered agent could run a step.
    NoSuitableAgent,
    /// A step's agent reported failure.
    StepExecutionFailed,
    /// A step attempt ran out of time.
    StepTimeout,
    /// A step was skipped because a dependency did not succeed.
    DependencyNotSatisfied,
    /// The whole workflow ran out of time.
    WorkflowTimeout,
    /// The run was cancelled.
    Cancelled,
    /// The orchestrator was at its concurrent workflow limit.
    CapacityExceeded,
    /// Something went wrong inside the engine.
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NoSuitableAgent => "NO_SUITABLE_AGENT",
            Self::StepExecutionFailed => "STEP_EXECUTION_FAILED",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::DependencyNotSatisfied => "DEPENDENCY_NOT_SATISFIED",
            Self::WorkflowTimeout => "WORKFLOW_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::CapacityExceeded => "CAPACITY_EXCEEDED",
            Self::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

/// How bad an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Worth noting, did not change the outcome by itself.
    Warning,
    /// A step failed.
    Error,
    /// The run cannot succeed.
    Critical,
}

/// Structured error recorded during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Category.
    pub code: ErrorCode,
    /// Human readable detail.
    pub message: String,
    /// Step the error belongs to, if any.
    pub step_id: Option<String>,
    /// Severity.
    pub severity: ErrorSeverity,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

impl WorkflowError {
    /// Creates an error stamped with the current time.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self { code, message: message.into(), step_id: None, severity, timestamp: Utc::now() }
    }

    /// Attaches the error to a step.
    #[must_use]
    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{}] {}: {}", self.code, step, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Step name.
    pub step_name: String,
    /// Final state.
    pub state: StepState,
    /// Attempts made.
    pub attempts: u32,
    /// Agent that made the last attempt.
    pub agent_id: Option<String>,
    /// Output of the successful attempt.
    pub output: serde_json::Value,
    /// Last failure message.
    pub error: Option<String>,
    /// First time the step entered Running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step settled.
    pub completed_at: Option<DateTime<Utc>>,
    /// Fallback whose result stands in for this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_fallback: Option<String>,
}

impl StepResult {
    /// Returns true if the step completed.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == StepState::Completed
    }
}

/// Final outcome of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Instance id.
    pub instance_id: String,
    /// Definition id.
    pub workflow_id: String,
    /// True iff `state` is Completed.
    pub success: bool,
    /// Terminal state.
    pub state: WorkflowState,
    /// Per-step outcomes in declaration order.
    pub step_results: Vec<StepResult>,
    /// Errors in the order they were recorded.
    pub errors: Vec<WorkflowError>,
    /// Shared variables at the end of the run.
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
    /// Wall clock duration in milliseconds.
    pub duration_ms: u64,
}

impl WorkflowResult {
    /// A failed result for a run that never executed any step.
    #[must_use]
    pub fn rejected(
        instance_id: impl Into<String>,
        workflow_id: impl Into<String>,
        errors: Vec<WorkflowError>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            workflow_id: workflow_id.into(),
            success: false,
            state: WorkflowState::Failed,
            step_results: Vec::new(),
            errors,
            variables: serde_json::Map::new(),
            started_at: now,
            completed_at: now,
            duration_ms: 0,
        }
    }

    /// Looks up a step result.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|s| s.step_id == step_id)
    }

    /// Errors with the given code.
    pub fn errors_with_code(&self, code: ErrorCode) -> impl Iterator<Item = &WorkflowError> {
        self.errors.iter().filter(move |e| e.code == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_value(ErrorCode::NoSuitableAgent).unwrap();
        assert_eq!(json, serde_json::json!("NO_SUITABLE_AGENT"));
        assert_eq!(ErrorCode::StepTimeout.to_string(), "STEP_TIMEOUT");
    }

    #[test]
    fn test_rejected_result() {
        let result = WorkflowResult::rejected(
            "i",
            "w",
            vec![WorkflowError::new(ErrorCode::ValidationFailed, "no steps", ErrorSeverity::Error)],
        );
        assert!(!result.success);
        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.errors_with_code(ErrorCode::ValidationFailed).count(), 1);
    }

    #[test]
    fn test_error_display() {
        let err = WorkflowError::new(ErrorCode::StepTimeout, "took too long", ErrorSeverity::Error)
            .for_step("s1");
        assert_eq!(err.to_string(), "[STEP_TIMEOUT] s1: took too long");
    }
}
