//! Bundle validation command.

use crate::bundle::Bundle;
use colored::Colorize;
use maestro_core::validate;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct JsonOutput {
    workflow_id: String,
    valid: bool,
    errors: Vec<String>,
}

/// Execute the validate command.
///
/// Returns false if the workflow definition has problems.
pub fn execute(path: &Path, json: bool) -> anyhow::Result<bool> {
    let bundle = Bundle::load(path)?;
    let errors: Vec<String> = validate(&bundle.workflow).iter().map(ToString::to_string).collect();
    let valid = errors.is_empty();

    if json {
        let output = JsonOutput { workflow_id: bundle.workflow.id.clone(), valid, errors };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(valid);
    }

    println!("{}", "maestro validate".bold().cyan());
    println!();
    println!(
        "  Workflow: {} ({} steps, {})",
        bundle.workflow.name.bold(),
        bundle.workflow.steps.len(),
        bundle.workflow.workflow_type
    );
    println!();

    if valid {
        println!("  {} Workflow is valid", "✓".green());
    } else {
        println!("  {} Found {} problem(s):", "✗".red(), errors.len());
        for error in &errors {
            println!("    - {}", error);
        }
    }
    Ok(valid)
}
