//! Agent layer for Maestro.
//!
//! This crate defines the core agent trait, the registry of live agents,
//! task-to-agent selection, and the narrow seams the orchestrator uses to
//! reach external collaborators (safety validation, message bus, metrics).

pub mod agents;
pub mod bus;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod safety;
pub mod selector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

pub use agents::{AttemptRecord, ScriptedAgent, ScriptedAgentSpec};
pub use bus::{BroadcastBus, BusError, BusMessage, MessageBus, NoopBus, publish_logged, topics};
pub use error::{AgentError, Result};
pub use metrics::{InMemoryMetrics, MetricsRecorder, NoopMetrics, TimingSummary};
pub use registry::AgentRegistry;
pub use safety::{AllowAllValidator, KeywordGuardrail, SafetyValidator, SafetyVerdict};
pub use selector::{
    ScoredAgent, ScoringStrategy, TaskRequirements, TaskSelector, WeightedScoring, rank_candidates,
};

/// Broad family an agent belongs to.
///
/// The orchestrator only matches on the type; what a given family does
/// internally is up to the agent implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Stimulus-response agents.
    Reactive,
    /// Belief-desire-intention agents.
    Bdi,
    /// Agents that maximise a utility function.
    UtilityBased,
    /// Mixed strategies.
    Hybrid,
    /// Any other family, by name.
    Other(String),
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reactive => write!(f, "reactive"),
            Self::Bdi => write!(f, "bdi"),
            Self::UtilityBased => write!(f, "utility_based"),
            Self::Hybrid => write!(f, "hybrid"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for AgentType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "reactive" => Self::Reactive,
            "bdi" => Self::Bdi,
            "utility_based" | "utility-based" | "utility" => Self::UtilityBased,
            "hybrid" => Self::Hybrid,
            _ => Self::Other(s.to_string()),
        })
    }
}

/// What an agent can do and how well it is doing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentCapabilities {
    /// Action types the agent accepts.
    pub supported_actions: HashSet<String>,
    /// Skill level per domain, each in `[0, 1]`.
    pub skill_levels: HashMap<String, f64>,
    /// Current load, in `[0, 1]`.
    pub load_factor: f64,
    /// Historical success rate, in `[0, 1]`.
    pub historical_performance: f64,
}

impl AgentCapabilities {
    /// Mean of all skill levels, or `0.0` when the agent declares none.
    #[must_use]
    pub fn average_skill(&self) -> f64 {
        if self.skill_levels.is_empty() {
            return 0.0;
        }
        self.skill_levels.values().sum::<f64>() / self.skill_levels.len() as f64
    }

    /// Returns true if every action in `required` is supported.
    #[must_use]
    pub fn supports_all<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|action| self.supported_actions.contains(action))
    }
}

/// Input handed to an agent for one attempt of one unit of work.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Free-text description of the work.
    pub description: String,
    /// Step-scoped inputs (shared variables overlaid with step parameters).
    pub inputs: serde_json::Map<String, serde_json::Value>,
    /// Workflow instance the request belongs to, if any.
    pub instance_id: Option<String>,
    /// Step the request belongs to, if any.
    pub step_id: Option<String>,
    /// Correlation id propagated from the caller.
    pub correlation_id: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Signalled when the surrounding workflow is cancelled or timed out.
    pub cancellation: CancellationToken,
}

impl AgentRequest {
    /// Creates a standalone request with no workflow association.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            inputs: serde_json::Map::new(),
            instance_id: None,
            step_id: None,
            correlation_id: None,
            attempt: 1,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Outcome of an agent's decide-and-execute call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action succeeded.
    pub success: bool,
    /// Output produced by the action.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variables to merge into the workflow's shared variables.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variable_updates: serde_json::Map<String, serde_json::Value>,
}

impl ActionResult {
    /// A successful result carrying `output`.
    #[must_use]
    pub fn success(output: serde_json::Value) -> Self {
        Self { success: true, output, ..Self::default() }
    }

    /// A failed result carrying `error`.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Self::default() }
    }

    /// Adds a variable update to the result.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variable_updates.insert(key.into(), value);
        self
    }
}

/// A trait that defines the interface for any autonomous agent.
///
/// The orchestrator never looks inside an agent: it matches on
/// [`Agent::agent_type`] and [`Agent::capabilities`], then hands work to
/// [`Agent::decide_and_execute`].
#[async_trait]
pub trait Agent: Send + Sync {
    /// Returns the unique ID of the agent.
    fn id(&self) -> &str;

    /// Returns a human readable name.
    fn name(&self) -> &str;

    /// Returns the agent family.
    fn agent_type(&self) -> AgentType;

    /// Returns a snapshot of the agent's current capabilities.
    fn capabilities(&self) -> AgentCapabilities;

    /// Decides on and performs an action for `request`.
    ///
    /// Failures are reported through [`ActionResult::success`]; agents
    /// should observe `request.cancellation` at their own await points.
    async fn decide_and_execute(&self, request: AgentRequest) -> ActionResult;
}

/// Serializable view of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// The agent's unique ID.
    pub id: String,
    /// The agent's name.
    pub name: String,
    /// The agent's family.
    pub agent_type: AgentType,
    /// Capabilities at the time the snapshot was taken.
    pub capabilities: AgentCapabilities,
}

impl AgentInfo {
    /// Takes a snapshot of `agent`.
    #[must_use]
    pub fn of(agent: &dyn Agent) -> Self {
        Self {
            id: agent.id().to_string(),
            name: agent.name().to_string(),
            agent_type: agent.agent_type(),
            capabilities: agent.capabilities(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_skill_empty_is_zero() {
        let caps = AgentCapabilities::default();
        assert!(caps.average_skill().abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_skill() {
        let mut caps = AgentCapabilities::default();
        caps.skill_levels.insert("weather".to_string(), 0.9);
        caps.skill_levels.insert("finance".to_string(), 0.5);
        assert!((caps.average_skill() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_agent_type_parse_roundtrip() {
        assert_eq!("BDI".parse::<AgentType>().unwrap(), AgentType::Bdi);
        assert_eq!("utility-based".parse::<AgentType>().unwrap(), AgentType::UtilityBased);
        assert_eq!("planner".parse::<AgentType>().unwrap(), AgentType::Other("planner".into()));
        assert_eq!(AgentType::UtilityBased.to_string(), "utility_based");
    }

    #[test]
    fn test_supports_all() {
        let mut caps = AgentCapabilities::default();
        caps.supported_actions.insert("search".to_string());
        caps.supported_actions.insert("summarize".to_string());

        let needed = ["search".to_string()];
        assert!(caps.supports_all(&needed));
        let needed = ["search".to_string(), "translate".to_string()];
        assert!(!caps.supports_all(&needed));
    }

    #[test]
    fn test_action_result_builders() {
        let ok = ActionResult::success(serde_json::json!({"temp": 21}))
            .with_variable("temp", serde_json::json!(21));
        assert!(ok.success);
        assert_eq!(ok.variable_updates.get("temp"), Some(&serde_json::json!(21)));

        let failed = ActionResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
