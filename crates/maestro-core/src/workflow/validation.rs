//! Workflow definition validation.
//!
//! A definition that fails validation never reaches the execution engine.
//! Validation collects every problem rather than stopping at the first.

use crate::models::WorkflowDefinition;
use crate::workflow::condition::Condition;
use crate::workflow::dag::{DagError, DependencyGraph};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// A problem found in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The workflow has no name.
    #[error("workflow name must not be empty")]
    EmptyName,

    /// The workflow has no steps.
    #[error("workflow must contain at least one step")]
    NoSteps,

    /// A step has no id.
    #[error("step at position {0} has an empty id")]
    EmptyStepId(usize),

    /// Two steps share an id.
    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    /// Two steps share a name.
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),

    /// A dependency does not resolve.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Step declaring the dependency.
        step: String,
        /// Missing id.
        dependency: String,
    },

    /// A step depends on itself.
    #[error("step '{0}' depends on itself")]
    SelfDependency(String),

    /// A fallback does not resolve.
    #[error("step '{step}' falls back to unknown step '{fallback}'")]
    UnknownFallback {
        /// Step declaring the fallback.
        step: String,
        /// Missing id.
        fallback: String,
    },

    /// A step falls back to itself.
    #[error("step '{0}' falls back to itself")]
    SelfFallback(String),

    /// Two steps name the same fallback.
    #[error("steps '{first}' and '{second}' share fallback step '{fallback}'")]
    SharedFallback {
        /// Fallback step.
        fallback: String,
        /// First step naming it.
        first: String,
        /// Later step naming it again.
        second: String,
    },

    /// A step depends on a step that only runs as a fallback.
    #[error("step '{step}' depends on fallback-only step '{dependency}'")]
    DependsOnFallback {
        /// Step declaring the dependency.
        step: String,
        /// Fallback-only step.
        dependency: String,
    },

    /// The dependency graph has a cycle.
    #[error("circular dependency detected: {0}")]
    Cycle(String),

    /// The workflow timeout is zero.
    #[error("workflow timeout must be greater than zero")]
    InvalidWorkflowTimeout,

    /// A step timeout is zero.
    #[error("step '{0}' timeout must be greater than zero")]
    InvalidStepTimeout(String),

    /// A condition does not parse.
    #[error("step '{step}' has an invalid condition: {reason}")]
    InvalidCondition {
        /// Step owning the condition.
        step: String,
        /// Parse error.
        reason: String,
    },

    /// A feedback edge is malformed.
    #[error("step '{step}' has an invalid feedback edge: {reason}")]
    InvalidFeedback {
        /// Step owning the edge.
        step: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A nested workflow is invalid.
    #[error("sub-workflow of step '{step}': {error}")]
    SubWorkflow {
        /// Step owning the sub-workflow.
        step: String,
        /// The nested problem.
        error: Box<ValidationError>,
    },
}

/// Which checks to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Include per-step checks: timeouts, conditions and feedback edges.
    pub check_steps: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self { check_steps: true }
    }
}

/// Validates `definition` with every check enabled.
pub fn validate(definition: &WorkflowDefinition) -> Vec<ValidationError> {
    validate_with(definition, ValidationOptions::default())
}

/// Validates `definition` with the given options.
pub fn validate_with(
    definition: &WorkflowDefinition,
    options: ValidationOptions,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if definition.name.trim().is_empty() {
        errors.push(ValidationError::EmptyName);
    }
    if definition.steps.is_empty() {
        errors.push(ValidationError::NoSteps);
        return errors;
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for (position, step) in definition.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            errors.push(ValidationError::EmptyStepId(position));
        }
        if !ids.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStepId(step.id.clone()));
        }
        if !names.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStepName(step.name.clone()));
        }
    }

    let fallback_only = definition.fallback_targets();
    let mut fallback_owners: HashMap<&str, &str> = HashMap::new();
    let mut references_ok = true;
    for step in &definition.steps {
        for dependency in &step.dependencies {
            if dependency == &step.id {
                errors.push(ValidationError::SelfDependency(step.id.clone()));
                references_ok = false;
            } else if !ids.contains(dependency.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
                references_ok = false;
            } else if fallback_only.contains(dependency) {
                errors.push(ValidationError::DependsOnFallback {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        if let Some(fallback) = &step.fallback_step_id {
            if fallback == &step.id {
                errors.push(ValidationError::SelfFallback(step.id.clone()));
            } else if !ids.contains(fallback.as_str()) {
                errors.push(ValidationError::UnknownFallback {
                    step: step.id.clone(),
                    fallback: fallback.clone(),
                });
            } else if let Some(first) = fallback_owners.insert(fallback.as_str(), step.id.as_str()) {
                errors.push(ValidationError::SharedFallback {
                    fallback: fallback.clone(),
                    first: first.to_string(),
                    second: step.id.clone(),
                });
            }
        }
    }

    // Self edges are already reported; the graph check only runs on
    // definitions whose references resolve.
    let graph = if references_ok {
        match DependencyGraph::from_definition(definition) {
            Ok(graph) => Some(graph),
            Err(DagError::CycleDetected(path)) => {
                errors.push(ValidationError::Cycle(path));
                None
            }
            Err(DagError::DependencyNotFound { step, dependency }) => {
                errors.push(ValidationError::UnknownDependency { step, dependency });
                None
            }
        }
    } else {
        None
    };

    if definition.timeout == Some(Duration::ZERO) {
        errors.push(ValidationError::InvalidWorkflowTimeout);
    }

    if options.check_steps {
        validate_steps(definition, graph.as_ref(), &mut errors);
    }

    for step in &definition.steps {
        if let Some(sub) = &step.sub_workflow {
            errors.extend(validate_with(sub, options).into_iter().map(|error| {
                ValidationError::SubWorkflow { step: step.id.clone(), error: Box::new(error) }
            }));
        }
    }

    errors
}

fn validate_steps(
    definition: &WorkflowDefinition,
    graph: Option<&DependencyGraph>,
    errors: &mut Vec<ValidationError>,
) {
    for step in &definition.steps {
        if step.timeout == Some(Duration::ZERO) {
            errors.push(ValidationError::InvalidStepTimeout(step.id.clone()));
        }

        if let Some(condition) = &step.condition {
            if let Err(e) = Condition::parse(condition) {
                errors.push(ValidationError::InvalidCondition {
                    step: step.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let Some(edge) = &step.feedback else {
            continue;
        };
        let invalid = |reason: String| ValidationError::InvalidFeedback { step: step.id.clone(), reason };

        if edge.max_iterations == 0 {
            errors.push(invalid("max_iterations must be greater than zero".to_string()));
        }
        if let Err(e) = Condition::parse(&edge.condition) {
            errors.push(invalid(format!("condition: {}", e)));
        }
        if definition.step(&edge.target).is_none() {
            errors.push(invalid(format!("unknown target '{}'", edge.target)));
        } else if let Some(graph) = graph {
            if !graph.is_upstream(&edge.target, &step.id) {
                errors.push(invalid(format!("target '{}' is not upstream", edge.target)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WorkflowStep, WorkflowType};

    fn base() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Valid", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("s1", "First"))
            .with_step(WorkflowStep::new("s2", "Second").depends_on("s1"))
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate(&base()).is_empty());
    }

    #[test]
    fn test_empty_name_and_steps() {
        let def = WorkflowDefinition::new("wf", "  ", WorkflowType::Sequential);
        assert_eq!(validate(&def), vec![ValidationError::EmptyName, ValidationError::NoSteps]);
    }

    #[test]
    fn test_duplicates() {
        let def = base().with_step(WorkflowStep::new("s1", "First"));
        let errors = validate(&def);
        assert!(errors.contains(&ValidationError::DuplicateStepId("s1".into())));
        assert!(errors.contains(&ValidationError::DuplicateStepName("First".into())));
    }

    #[test]
    fn test_unresolved_references() {
        let def = base()
            .with_step(WorkflowStep::new("s3", "Third").depends_on("ghost").with_fallback("phantom"));
        let errors = validate(&def);
        assert!(errors.contains(&ValidationError::UnknownDependency {
            step: "s3".into(),
            dependency: "ghost".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownFallback {
            step: "s3".into(),
            fallback: "phantom".into()
        }));
    }

    #[test]
    fn test_cycle_rejected() {
        let def = WorkflowDefinition::new("wf", "Cyclic", WorkflowType::Parallel)
            .with_step(WorkflowStep::new("a", "A").depends_on("b"))
            .with_step(WorkflowStep::new("b", "B").depends_on("a"));
        let errors = validate(&def);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::Cycle(_))));
    }

    #[test]
    fn test_self_references() {
        let def = WorkflowDefinition::new("wf", "Selfish", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("a", "A").depends_on("a").with_fallback("a"));
        let errors = validate(&def);
        assert!(errors.contains(&ValidationError::SelfDependency("a".into())));
        assert!(errors.contains(&ValidationError::SelfFallback("a".into())));
    }

    #[test]
    fn test_zero_timeouts() {
        let mut def = base().with_timeout(Duration::ZERO);
        def.steps[0].timeout = Some(Duration::ZERO);
        let errors = validate(&def);
        assert!(errors.contains(&ValidationError::InvalidWorkflowTimeout));
        assert!(errors.contains(&ValidationError::InvalidStepTimeout("s1".into())));
    }

    #[test]
    fn test_step_checks_can_be_disabled() {
        let mut def = base();
        def.steps[0].timeout = Some(Duration::ZERO);
        def.steps[1].condition = Some("a ==".into());
        assert_eq!(validate(&def).len(), 2);
        assert!(validate_with(&def, ValidationOptions { check_steps: false }).is_empty());
    }

    #[test]
    fn test_depends_on_fallback_only_step() {
        let def = WorkflowDefinition::new("wf", "Fallbacks", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("main", "Main").with_fallback("backup"))
            .with_step(WorkflowStep::new("backup", "Backup"))
            .with_step(WorkflowStep::new("after", "After").depends_on("backup"));
        assert_eq!(
            validate(&def),
            vec![ValidationError::DependsOnFallback {
                step: "after".into(),
                dependency: "backup".into()
            }]
        );
    }

    #[test]
    fn test_shared_fallback_rejected() {
        let def = WorkflowDefinition::new("wf", "Fallbacks", WorkflowType::Parallel)
            .with_step(WorkflowStep::new("p1", "One").with_fallback("spare"))
            .with_step(WorkflowStep::new("p2", "Two").with_fallback("spare"))
            .with_step(WorkflowStep::new("spare", "Spare"));
        assert_eq!(
            validate(&def),
            vec![ValidationError::SharedFallback {
                fallback: "spare".into(),
                first: "p1".into(),
                second: "p2".into()
            }]
        );
    }

    #[test]
    fn test_feedback_edges() {
        let good = WorkflowDefinition::new("wf", "Loop", WorkflowType::FeedbackLoop)
            .with_step(WorkflowStep::new("draft", "Draft"))
            .with_step(
                WorkflowStep::new("review", "Review")
                    .depends_on("draft")
                    .with_feedback("draft", "!approved", 3),
            );
        assert!(validate(&good).is_empty());

        let bad = WorkflowDefinition::new("wf", "Loop", WorkflowType::FeedbackLoop)
            .with_step(WorkflowStep::new("draft", "Draft"))
            .with_step(WorkflowStep::new("other", "Other"))
            .with_step(
                WorkflowStep::new("review", "Review")
                    .depends_on("draft")
                    .with_feedback("other", "!approved", 0),
            );
        let errors = validate(&bad);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(e, ValidationError::InvalidFeedback { .. })));
    }

    #[test]
    fn test_sub_workflow_errors_are_prefixed() {
        let nested = WorkflowDefinition::new("inner", "", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("x", "X"));
        let def = WorkflowDefinition::new("wf", "Outer", WorkflowType::Hierarchical)
            .with_step(WorkflowStep::new("parent", "Parent").with_sub_workflow(nested));
        let errors = validate(&def);
        assert_eq!(
            errors,
            vec![ValidationError::SubWorkflow {
                step: "parent".into(),
                error: Box::new(ValidationError::EmptyName)
            }]
        );
        assert!(errors[0].to_string().contains("sub-workflow of step 'parent'"));
    }
}
