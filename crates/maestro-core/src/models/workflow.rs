//! Workflow definitions.
//!
//! A [`WorkflowDefinition`] is a declarative graph of [`WorkflowStep`]s
//! plus an execution mode and policies. Definitions are built by callers,
//! validated once, and then consumed read-only by the execution engine.

use crate::models::duration;
use maestro_agents::{AgentType, TaskRequirements};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// How the engine schedules a workflow's steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// One step at a time, in dependency order.
    #[default]
    Sequential,
    /// Every ready step at once, bounded by the step concurrency limit.
    Parallel,
    /// One step at a time, each gated by its condition.
    Conditional,
    /// Like parallel, with steps that may run nested sub-workflows.
    Hierarchical,
    /// Sequential, with bounded re-entry into earlier steps.
    FeedbackLoop,
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
            Self::Hierarchical => "hierarchical",
            Self::FeedbackLoop => "feedback_loop",
        };
        f.write_str(name)
    }
}

/// What the engine does when a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlingMode {
    /// Stop dispatching new steps after the first failure.
    #[default]
    StopOnError,
    /// Record the failure and keep going.
    ContinueOnError,
    /// Stop on error, but give steps without their own retry policy the
    /// engine's default one.
    RetryOnError,
    /// Stop on error, but first try the next best agent.
    UseAlternative,
}

impl ErrorHandlingMode {
    /// Whether a non-tolerated step failure halts dispatch.
    #[must_use]
    pub fn stops_on_failure(self) -> bool {
        !matches!(self, Self::ContinueOnError)
    }
}

/// Bounded re-entry edge used by feedback-loop workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackEdge {
    /// Upstream step to jump back to.
    pub target: String,
    /// Re-enter while this condition holds after the step completes.
    pub condition: String,
    /// Upper bound on re-entries through this edge.
    #[serde(default = "default_feedback_iterations")]
    pub max_iterations: u32,
}

fn default_feedback_iterations() -> u32 {
    3
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique id within the workflow.
    pub id: String,
    /// Unique human readable name.
    pub name: String,
    /// Agent family that must run the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_agent_type: Option<AgentType>,
    /// Actions the agent must support.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_capabilities: BTreeSet<String>,
    /// Step inputs, overlaid on the shared variables.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    /// Ids of steps that must settle first.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,
    /// Run only when this expression holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-attempt timeout.
    #[serde(
        default,
        rename = "timeout_secs",
        with = "duration::option_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Pause between attempts.
    #[serde(default, rename = "retry_delay_secs", with = "duration::secs")]
    pub retry_delay: Duration,
    /// Step to run in place of this one once retries are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_step_id: Option<String>,
    /// The workflow only completes if this step completes.
    #[serde(default)]
    pub is_critical: bool,
    /// A failure of this step does not halt the workflow.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Nested workflow run in place of an agent call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<Box<WorkflowDefinition>>,
    /// Re-entry edge for feedback-loop workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<FeedbackEdge>,
}

impl WorkflowStep {
    /// Creates a step with no requirements, dependencies or policies.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            required_agent_type: None,
            required_capabilities: BTreeSet::new(),
            parameters: serde_json::Map::new(),
            dependencies: BTreeSet::new(),
            condition: None,
            timeout: None,
            retry_count: 0,
            retry_delay: Duration::ZERO,
            fallback_step_id: None,
            is_critical: false,
            continue_on_failure: false,
            sub_workflow: None,
            feedback: None,
        }
    }

    /// Requires an agent of `agent_type`.
    #[must_use]
    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.required_agent_type = Some(agent_type);
        self
    }

    /// Requires the agent to support `capability`.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.insert(step_id.into());
        self
    }

    /// Gates the step on `condition`.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    /// Sets the fallback step.
    #[must_use]
    pub fn with_fallback(mut self, step_id: impl Into<String>) -> Self {
        self.fallback_step_id = Some(step_id.into());
        self
    }

    /// Marks the step critical.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.is_critical = true;
        self
    }

    /// Lets the workflow carry on when this step fails.
    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Runs `workflow` in place of an agent call.
    #[must_use]
    pub fn with_sub_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.sub_workflow = Some(Box::new(workflow));
        self
    }

    /// Adds a feedback edge back to `target`.
    #[must_use]
    pub fn with_feedback(
        mut self,
        target: impl Into<String>,
        condition: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        self.feedback =
            Some(FeedbackEdge { target: target.into(), condition: condition.into(), max_iterations });
        self
    }

    /// Agent requirements derived from the step.
    #[must_use]
    pub fn requirements(&self) -> TaskRequirements {
        TaskRequirements {
            agent_type: self.required_agent_type.clone(),
            required_capabilities: self.required_capabilities.iter().cloned().collect(),
            ..TaskRequirements::default()
        }
    }

    /// Free text used to score agents: the name followed by every string
    /// parameter value.
    #[must_use]
    pub fn description(&self) -> String {
        let mut text = self.name.clone();
        for value in self.parameters.values() {
            if let Some(s) = value.as_str() {
                text.push(' ');
                text.push_str(s);
            }
        }
        text
    }
}

/// A declarative workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow id.
    pub id: String,
    /// Workflow name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Scheduling mode.
    #[serde(default)]
    pub workflow_type: WorkflowType,
    /// Steps in declaration order.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    /// Whole-workflow timeout.
    #[serde(
        default,
        rename = "timeout_secs",
        with = "duration::option_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Failure policy; the engine default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandlingMode>,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Definition version.
    #[serde(default = "default_version")]
    pub version: String,
}

impl WorkflowDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, workflow_type: WorkflowType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            workflow_type,
            steps: Vec::new(),
            timeout: None,
            error_handling: None,
            tags: Vec::new(),
            version: default_version(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the whole-workflow timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn with_error_handling(mut self, mode: ErrorHandlingMode) -> Self {
        self.error_handling = Some(mode);
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Looks up a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in declaration order.
    #[must_use]
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Ids of steps that only run as another step's fallback.
    #[must_use]
    pub fn fallback_targets(&self) -> BTreeSet<String> {
        self.steps.iter().filter_map(|s| s.fallback_step_id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_step_defaults() {
        let step: WorkflowStep =
            serde_json::from_value(serde_json::json!({"id": "s1", "name": "Fetch"})).unwrap();
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.retry_delay, Duration::ZERO);
        assert!(step.timeout.is_none());
        assert!(!step.is_critical);
        assert!(step.dependencies.is_empty());
    }

    #[test]
    fn test_deserialize_durations_as_seconds() {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "wf",
            "name": "Demo",
            "workflow_type": "parallel",
            "timeout_secs": 1.5,
            "error_handling": "continue_on_error",
            "steps": [{
                "id": "s1",
                "name": "Fetch",
                "required_agent_type": "reactive",
                "timeout_secs": 0.25,
                "retry_count": 2,
                "retry_delay_secs": 0.1
            }]
        }))
        .unwrap();

        assert_eq!(def.workflow_type, WorkflowType::Parallel);
        assert_eq!(def.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(def.error_handling, Some(ErrorHandlingMode::ContinueOnError));
        assert_eq!(def.version, "1.0.0");
        let step = &def.steps[0];
        assert_eq!(step.timeout, Some(Duration::from_millis(250)));
        assert_eq!(step.retry_delay, Duration::from_millis(100));
        assert_eq!(step.required_agent_type, Some(AgentType::Reactive));
    }

    #[test]
    fn test_negative_timeout_rejected_by_serde() {
        let parsed: Result<WorkflowStep, _> =
            serde_json::from_value(serde_json::json!({"id": "s", "name": "n", "timeout_secs": -1.0}));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_step_description_includes_string_parameters() {
        let step = WorkflowStep::new("s", "Forecast")
            .with_parameter("city", serde_json::json!("weather in Oslo"))
            .with_parameter("days", serde_json::json!(3));
        assert_eq!(step.description(), "Forecast weather in Oslo");
    }

    #[test]
    fn test_fallback_targets() {
        let def = WorkflowDefinition::new("wf", "wf", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("a", "A").with_fallback("b"))
            .with_step(WorkflowStep::new("b", "B"));
        assert_eq!(def.fallback_targets().into_iter().collect::<Vec<_>>(), vec!["b"]);
    }
}
