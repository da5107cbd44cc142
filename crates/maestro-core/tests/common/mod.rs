//! Shared test utilities for Maestro Core integration tests.
//!
//! Every test builds its own orchestrator wired to an in-process broadcast
//! bus and in-memory metrics, and registers scripted agents on it.

#![allow(dead_code)]

use maestro_agents::{AgentType, BroadcastBus, BusMessage, InMemoryMetrics, ScriptedAgent};
use maestro_core::{Orchestrator, OrchestratorConfig, WorkflowStep};
use std::sync::Arc;
use tokio::sync::broadcast;

/// An orchestrator together with the collaborators tests inspect.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub bus: Arc<BroadcastBus>,
    pub metrics: Arc<InMemoryMetrics>,
}

/// Test configuration: short retry delays and grace periods.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.engine.default_retry_delay_ms = 5;
    config.engine.cancellation_grace_ms = 500;
    config
}

/// Builds a harness with `config`.
pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let bus = Arc::new(BroadcastBus::new(4096));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::builder()
        .config(config)
        .broadcast_bus(bus.clone())
        .metrics(metrics.clone())
        .build()
        .expect("test configuration is valid");
    Harness { orchestrator, bus, metrics }
}

/// Builds a harness with [`test_config`].
pub fn harness() -> Harness {
    harness_with(test_config())
}

impl Harness {
    /// Registers `agent` and returns a handle to inspect it afterwards.
    pub async fn register(&self, agent: ScriptedAgent) -> Arc<ScriptedAgent> {
        let agent = Arc::new(agent);
        self.orchestrator.register_agent(agent.clone()).await.expect("agent registers");
        agent
    }
}

/// A reactive agent that only serves steps requiring `action`.
pub fn worker(id: &str, action: &str) -> ScriptedAgent {
    ScriptedAgent::new(id, AgentType::Reactive).with_action(action)
}

/// A step that requires the `action` capability.
pub fn step(id: &str, action: &str) -> WorkflowStep {
    WorkflowStep::new(id, format!("Step {id}")).with_capability(action)
}

/// Drains everything currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<BusMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}
