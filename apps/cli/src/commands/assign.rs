//! Task assignment command.

use crate::bundle::Bundle;
use colored::Colorize;
use maestro_agents::{AgentError, AgentInfo, AgentType, TaskRequirements};
use maestro_core::{OrchestratorConfig, OrchestratorError};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct JsonOutput {
    task: String,
    assigned: Option<AgentInfo>,
    error: Option<String>,
}

/// Execute the assign command.
///
/// Returns false if no agent could take the task.
pub async fn execute(
    path: &Path,
    task: &str,
    agent_type: Option<String>,
    capabilities: Vec<String>,
    json: bool,
) -> anyhow::Result<bool> {
    let bundle = Bundle::load(path)?;
    let orchestrator = bundle.orchestrator(OrchestratorConfig::default()).await?;

    let requirements = TaskRequirements {
        agent_type: agent_type.map(|t| t.parse::<AgentType>().unwrap_or_else(|never| match never {})),
        required_capabilities: capabilities.into_iter().collect(),
        ..TaskRequirements::default()
    };

    let (assigned, error) = match orchestrator.assign_task(task, Some(&requirements)).await {
        Ok(agent) => (Some(AgentInfo::of(agent.as_ref())), None),
        Err(OrchestratorError::Agent(e @ (AgentError::NoSuitableAgent(_) | AgentError::UnsafeTask(_)))) => {
            (None, Some(e.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let ok = assigned.is_some();

    if json {
        let output = JsonOutput { task: task.to_string(), assigned, error };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(ok);
    }

    println!("{}", "maestro assign".bold().cyan());
    println!();
    println!("  Task: {}", task);
    println!();
    match (assigned, error) {
        (Some(info), _) => {
            println!("  {} Assigned to {} ({})", "✓".green(), info.id.bold(), info.agent_type);
        }
        (None, error) => {
            println!("  {} {}", "✗".red(), error.unwrap_or_default());
        }
    }
    Ok(ok)
}
