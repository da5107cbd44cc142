//! Scripted agent implementation.
//!
//! This agent does no reasoning of its own: it waits for a configured
//! delay, fails a configured number of times, then returns a fixed output.
//! Useful for demos, dry runs and tests.

use crate::{ActionResult, Agent, AgentCapabilities, AgentRequest, AgentType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// Declarative description of a scripted agent, as found in bundle files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedAgentSpec {
    /// Agent id.
    pub id: String,
    /// Display name, defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Agent family.
    pub agent_type: AgentType,
    /// Advertised capabilities.
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    /// Simulated work time per call.
    #[serde(default)]
    pub delay_ms: u64,
    /// Number of initial calls that fail.
    #[serde(default)]
    pub fail_times: u32,
    /// Fail every call.
    #[serde(default)]
    pub always_fail: bool,
    /// Output returned on success.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Variables set on success.
    #[serde(default)]
    pub variable_updates: serde_json::Map<String, serde_json::Value>,
}

/// One call made to a scripted agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// Step the call was made for.
    pub step_id: Option<String>,
    /// Attempt number carried by the request.
    pub attempt: u32,
    /// When the call began.
    pub started_at: DateTime<Utc>,
    /// When the call returned.
    pub finished_at: DateTime<Utc>,
    /// Whether it reported success.
    pub success: bool,
}

/// An agent that follows a fixed script.
#[derive(Debug)]
pub struct ScriptedAgent {
    id: String,
    name: String,
    agent_type: AgentType,
    capabilities: AgentCapabilities,
    delay: Duration,
    fail_times: u32,
    always_fail: bool,
    output: serde_json::Value,
    variable_updates: serde_json::Map<String, serde_json::Value>,
    calls: AtomicU32,
    log: Mutex<Vec<AttemptRecord>>,
}

impl ScriptedAgent {
    /// Creates a scripted agent that succeeds immediately with a null output.
    #[must_use]
    pub fn new(id: impl Into<String>, agent_type: AgentType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type,
            capabilities: AgentCapabilities::default(),
            delay: Duration::ZERO,
            fail_times: 0,
            always_fail: false,
            output: serde_json::Value::Null,
            variable_updates: serde_json::Map::new(),
            calls: AtomicU32::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Builds an agent from its declarative description.
    #[must_use]
    pub fn from_spec(spec: ScriptedAgentSpec) -> Self {
        let mut agent = Self::new(spec.id, spec.agent_type);
        if let Some(name) = spec.name {
            agent.name = name;
        }
        agent.capabilities = spec.capabilities;
        agent.delay = Duration::from_millis(spec.delay_ms);
        agent.fail_times = spec.fail_times;
        agent.always_fail = spec.always_fail;
        agent.output = spec.output;
        agent.variable_updates = spec.variable_updates;
        agent
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a supported action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.capabilities.supported_actions.insert(action.into());
        self
    }

    /// Adds a skill level.
    #[must_use]
    pub fn with_skill(mut self, domain: impl Into<String>, level: f64) -> Self {
        self.capabilities.skill_levels.insert(domain.into(), level);
        self
    }

    /// Sets the load factor.
    #[must_use]
    pub fn with_load(mut self, load: f64) -> Self {
        self.capabilities.load_factor = load;
        self
    }

    /// Sets the historical performance.
    #[must_use]
    pub fn with_performance(mut self, performance: f64) -> Self {
        self.capabilities.historical_performance = performance;
        self
    }

    /// Sets the simulated work time per call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the first `times` calls fail.
    #[must_use]
    pub fn failing_times(mut self, times: u32) -> Self {
        self.fail_times = times;
        self
    }

    /// Makes every call fail.
    #[must_use]
    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Sets the output returned on success.
    #[must_use]
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = output;
        self
    }

    /// Adds a variable update returned on success.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variable_updates.insert(key.into(), value);
        self
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every completed call, in completion order.
    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn record(&self, request: &AgentRequest, started_at: DateTime<Utc>, success: bool) {
        if let Ok(mut log) = self.log.lock() {
            log.push(AttemptRecord {
                step_id: request.step_id.clone(),
                attempt: request.attempt,
                started_at,
                finished_at: Utc::now(),
                success,
            });
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type.clone()
    }

    fn capabilities(&self) -> AgentCapabilities {
        self.capabilities.clone()
    }

    async fn decide_and_execute(&self, request: AgentRequest) -> ActionResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let started_at = Utc::now();

        debug!(
            agent_id = %self.id,
            step_id = ?request.step_id,
            attempt = request.attempt,
            call,
            "ScriptedAgent executing"
        );

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = request.cancellation.cancelled() => {
                    self.record(&request, started_at, false);
                    return ActionResult::failure("cancelled");
                }
            }
        }

        if self.always_fail || call <= self.fail_times {
            self.record(&request, started_at, false);
            return ActionResult::failure(format!("scripted failure on call {}", call));
        }

        self.record(&request, started_at, true);
        ActionResult {
            success: true,
            output: self.output.clone(),
            error: None,
            variable_updates: self.variable_updates.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fails_then_succeeds() {
        let agent = ScriptedAgent::new("s", AgentType::Reactive)
            .failing_times(2)
            .with_output(serde_json::json!("done"));

        assert!(!agent.decide_and_execute(AgentRequest::new("x")).await.success);
        assert!(!agent.decide_and_execute(AgentRequest::new("x")).await.success);
        let third = agent.decide_and_execute(AgentRequest::new("x")).await;
        assert!(third.success);
        assert_eq!(third.output, serde_json::json!("done"));
        assert_eq!(agent.call_count(), 3);
        assert_eq!(agent.attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_delay() {
        let agent = ScriptedAgent::new("slow", AgentType::Reactive).with_delay(Duration::from_secs(30));
        let request = AgentRequest::new("x");
        let token = request.cancellation.clone();

        let handle = tokio::spawn(async move { agent.decide_and_execute(request).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_from_spec() {
        let spec: ScriptedAgentSpec = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "agent_type": "reactive",
            "capabilities": {
                "skill_levels": {"weather": 0.9},
                "load_factor": 0.1,
                "historical_performance": 0.8
            },
            "output": {"forecast": "sunny"}
        }))
        .unwrap();

        let agent = ScriptedAgent::from_spec(spec);
        assert_eq!(agent.id(), "a1");
        assert_eq!(agent.name(), "a1");
        assert_eq!(agent.agent_type(), AgentType::Reactive);
        assert!((agent.capabilities().load_factor - 0.1).abs() < f64::EPSILON);
    }
}
