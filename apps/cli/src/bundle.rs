//! Workflow bundle files.
//!
//! A bundle is a JSON document holding everything one run needs:
//!
//! ```json
//! {
//!   "agents": [{ "id": "a1", "agent_type": "reactive" }],
//!   "workflow": { "id": "wf", "name": "Demo", "steps": [{ "id": "s1", "name": "Hello" }] },
//!   "variables": { "region": "eu" },
//!   "input": null
//! }
//! ```

use anyhow::Context;
use maestro_agents::{ScriptedAgent, ScriptedAgentSpec};
use maestro_core::{Orchestrator, OrchestratorConfig, WorkflowContext, WorkflowDefinition};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// Scripted agents plus the workflow they serve.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub agents: Vec<ScriptedAgentSpec>,
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Bundle {
    /// Reads and parses a bundle file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bundle {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse bundle {}", path.display()))
    }

    /// Run context seeded with the bundle's variables and input.
    pub fn context(&self) -> WorkflowContext {
        let mut context = WorkflowContext::new().with_input(self.input.clone());
        context.variables.clone_from(&self.variables);
        context
    }

    /// Builds an orchestrator with every bundled agent registered.
    pub async fn orchestrator(&self, config: OrchestratorConfig) -> anyhow::Result<Orchestrator> {
        let orchestrator = Orchestrator::builder().config(config).build()?;
        for spec in &self.agents {
            orchestrator
                .register_agent(Arc::new(ScriptedAgent::from_spec(spec.clone())))
                .await
                .with_context(|| format!("Failed to register agent '{}'", spec.id))?;
        }
        Ok(orchestrator)
    }
}
