//! Per-instance runtime context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity, input and shared variables of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Unique id of this run.
    pub instance_id: String,
    /// Id tying this run to the caller's request.
    pub correlation_id: String,
    /// Caller supplied input.
    #[serde(default)]
    pub input: serde_json::Value,
    /// Variables shared by every step of the run.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// When the context was created.
    pub started_at: DateTime<Utc>,
}

impl WorkflowContext {
    /// Creates a context with fresh ids and no input.
    #[must_use]
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            input: serde_json::Value::Null,
            variables: serde_json::Map::new(),
            started_at: Utc::now(),
        }
    }

    /// Overrides the instance id.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Overrides the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Sets the input.
    #[must_use]
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    /// Sets a shared variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Context for a nested run started by step `step_id`.
    ///
    /// The child shares the correlation id and input and starts from the
    /// given variables.
    #[must_use]
    pub fn child(
        &self,
        step_id: &str,
        variables: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            instance_id: format!("{}/{}", self.instance_id, step_id),
            correlation_id: self.correlation_id.clone(),
            input: self.input.clone(),
            variables,
            started_at: Utc::now(),
        }
    }
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = WorkflowContext::new();
        let b = WorkflowContext::new();
        assert_ne!(a.instance_id, b.instance_id);
        assert_ne!(a.instance_id, a.correlation_id);
    }

    #[test]
    fn test_child_context() {
        let parent = WorkflowContext::new()
            .with_instance_id("run-1")
            .with_input(serde_json::json!({"city": "Oslo"}));
        let child = parent.child("nested", serde_json::Map::new());
        assert_eq!(child.instance_id, "run-1/nested");
        assert_eq!(child.correlation_id, parent.correlation_id);
        assert_eq!(child.input["city"], "Oslo");
    }
}
