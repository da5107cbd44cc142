//! Workflow run command.

use crate::bundle::Bundle;
use anyhow::Context;
use colored::{ColoredString, Colorize};
use maestro_core::{OrchestratorConfig, StepState, WorkflowResult};
use std::path::Path;
use tracing::info;

/// Execute the run command.
///
/// Returns false if the workflow did not complete successfully.
pub async fn execute(path: &Path, config: Option<&Path>, json: bool) -> anyhow::Result<bool> {
    let bundle = Bundle::load(path)?;
    let config = match config {
        Some(config) => OrchestratorConfig::load_from_file(config)
            .with_context(|| format!("Failed to load configuration {}", config.display()))?,
        None => OrchestratorConfig::default(),
    };

    let orchestrator = bundle.orchestrator(config).await?;
    info!(
        workflow_id = %bundle.workflow.id,
        agents = bundle.agents.len(),
        "Running bundle"
    );
    let result = orchestrator.execute_workflow(&bundle.workflow, Some(bundle.context())).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_human(&bundle, &result);
    }
    Ok(result.success)
}

fn paint_state(state: StepState) -> ColoredString {
    let label = state.to_string();
    match state {
        StepState::Completed => label.green(),
        StepState::Failed | StepState::TimedOut => label.red(),
        StepState::Skipped => label.yellow(),
        StepState::NotStarted | StepState::Waiting | StepState::Running => label.dimmed(),
    }
}

fn print_human(bundle: &Bundle, result: &WorkflowResult) {
    println!("{}", "maestro run".bold().cyan());
    println!();
    println!("  Workflow: {} ({})", bundle.workflow.name.bold(), result.instance_id.dimmed());
    println!();

    let width = result.step_results.iter().map(|r| r.step_id.len()).max().unwrap_or(4).max(4);
    println!("  {:<width$}  {:<11}  {:>8}  {}", "STEP", "STATE", "ATTEMPTS", "AGENT", width = width);
    for step in &result.step_results {
        let agent = step.used_fallback.as_ref().map_or_else(
            || step.agent_id.clone().unwrap_or_else(|| "-".to_string()),
            |fallback| format!("fallback {}", fallback),
        );
        println!(
            "  {:<width$}  {:<11}  {:>8}  {}",
            step.step_id,
            paint_state(step.state),
            step.attempts,
            agent,
            width = width
        );
    }

    if !result.errors.is_empty() {
        println!();
        println!("  Errors:");
        for error in &result.errors {
            println!("    - {}", error);
        }
    }

    println!();
    let state = result.state.to_string();
    if result.success {
        println!("  {} Workflow {} in {}ms", "✓".green(), state.green(), result.duration_ms);
    } else {
        println!("  {} Workflow {} in {}ms", "✗".red(), state.red(), result.duration_ms);
    }
}
