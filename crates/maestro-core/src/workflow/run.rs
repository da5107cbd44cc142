//! State shared by everything working on one workflow instance.

use crate::config::EngineConfig;
use crate::models::{
    ErrorCode, ErrorHandlingMode, ErrorSeverity, StepResult, StepState, WorkflowContext,
    WorkflowDefinition, WorkflowError, WorkflowStatus, WorkflowStep,
};
use crate::workflow::condition::Condition;
use crate::workflow::dag::DependencyGraph;
use crate::workflow::engine::ExecutionEngine;
use crate::workflow::tracker::StatusHandle;
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// What a settled step leaves behind besides its status.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepOutcome {
    pub output: Value,
    pub error: Option<String>,
    pub used_fallback: Option<String>,
}

/// One workflow instance in flight.
pub(crate) struct Run {
    pub engine: ExecutionEngine,
    pub definition: WorkflowDefinition,
    pub context: WorkflowContext,
    pub handle: StatusHandle,
    pub config: EngineConfig,
    pub mode: ErrorHandlingMode,
    /// Steps in dependency order.
    pub order: Vec<String>,
    /// Steps that only run as a fallback.
    pub fallbacks: BTreeSet<String>,
    claimed_fallbacks: Mutex<HashSet<String>>,
    variables: Mutex<Map<String, Value>>,
    outcomes: Mutex<HashMap<String, StepOutcome>>,
    errors: Mutex<Vec<WorkflowError>>,
    halted: AtomicBool,
    deadline_hit: AtomicBool,
}

impl Run {
    pub fn new(
        engine: ExecutionEngine,
        definition: WorkflowDefinition,
        context: WorkflowContext,
        handle: StatusHandle,
        config: EngineConfig,
        graph: &DependencyGraph,
    ) -> Self {
        let mode = definition.error_handling.unwrap_or(config.default_error_handling);
        let order = graph.topological_order();
        let fallbacks = definition.fallback_targets();
        let variables = Mutex::new(context.variables.clone());
        Self {
            engine,
            definition,
            context,
            handle,
            config,
            mode,
            order,
            fallbacks,
            claimed_fallbacks: Mutex::new(HashSet::new()),
            variables,
            outcomes: Mutex::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            halted: AtomicBool::new(false),
            deadline_hit: AtomicBool::new(false),
        }
    }

    /// Looks up a step of this run.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.definition.step(step_id)
    }

    /// Stops dispatching new steps.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// True once dispatch was stopped by a failure.
    pub fn was_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// True when no new step may be dispatched.
    pub fn is_halted(&self) -> bool {
        self.was_halted() || self.handle.token().is_cancelled()
    }

    /// Records that the workflow deadline fired.
    pub fn mark_deadline_hit(&self) {
        self.deadline_hit.store(true, Ordering::SeqCst);
    }

    /// True if the workflow deadline fired.
    pub fn deadline_hit(&self) -> bool {
        self.deadline_hit.load(Ordering::SeqCst)
    }

    /// Retry count and delay for `step` under the run's error handling.
    pub fn retry_policy(&self, step: &WorkflowStep) -> (u32, Duration) {
        if self.mode == ErrorHandlingMode::RetryOnError && step.retry_count == 0 {
            (self.config.default_retry_count, self.config.default_retry_delay())
        } else {
            (step.retry_count, step.retry_delay)
        }
    }

    /// Per-attempt timeout for `step`.
    pub fn step_timeout(&self, step: &WorkflowStep) -> Duration {
        step.timeout.unwrap_or_else(|| self.config.default_step_timeout())
    }

    /// Shared variables overlaid with the step's parameters.
    pub async fn step_inputs(&self, step: &WorkflowStep) -> Map<String, Value> {
        let mut inputs = self.variables.lock().await.clone();
        for (key, value) in &step.parameters {
            inputs.insert(key.clone(), value.clone());
        }
        inputs
    }

    /// Snapshot of the shared variables.
    pub async fn variables(&self) -> Map<String, Value> {
        self.variables.lock().await.clone()
    }

    /// Merges `updates` into the shared variables.
    pub async fn merge_variables(&self, updates: Map<String, Value>) {
        if updates.is_empty() {
            return;
        }
        let mut variables = self.variables.lock().await;
        for (key, value) in updates {
            variables.insert(key, value);
        }
    }

    pub async fn set_outcome(&self, step_id: &str, outcome: StepOutcome) {
        self.outcomes.lock().await.insert(step_id.to_string(), outcome);
    }

    pub async fn clear_outcome(&self, step_id: &str) {
        self.outcomes.lock().await.remove(step_id);
    }

    /// Claims `fallback_id` for one failed step. A fallback runs at most once
    /// per instance, so only the first claim succeeds.
    pub async fn claim_fallback(&self, fallback_id: &str) -> bool {
        self.claimed_fallbacks.lock().await.insert(fallback_id.to_string())
    }

    /// Records an error against the run.
    pub async fn record_error(&self, error: WorkflowError) {
        match error.severity {
            ErrorSeverity::Warning => debug!(error = %error, "Recorded workflow warning"),
            ErrorSeverity::Error | ErrorSeverity::Critical => {
                warn!(instance_id = %self.context.instance_id, error = %error, "Recorded workflow error");
            }
        }
        self.errors.lock().await.push(error);
    }

    pub async fn errors(&self) -> Vec<WorkflowError> {
        self.errors.lock().await.clone()
    }

    /// Logs a per-step event at debug when detailed logging is on.
    pub fn log_step(&self, step_id: &str, event: &str) {
        if self.config.detailed_logging {
            debug!(instance_id = %self.context.instance_id, step_id = %step_id, "{event}");
        } else {
            trace!(instance_id = %self.context.instance_id, step_id = %step_id, "{event}");
        }
    }

    /// First dependency of `step` that does not let it run.
    pub async fn unsatisfied_dependency(&self, step: &WorkflowStep) -> Option<String> {
        let snapshot = self.handle.snapshot().await;
        step.dependencies
            .iter()
            .find(|dependency| !self.satisfies(&snapshot, dependency))
            .cloned()
    }

    fn satisfies(&self, snapshot: &WorkflowStatus, dependency: &str) -> bool {
        let continuing = self.mode == ErrorHandlingMode::ContinueOnError;
        match snapshot.step(dependency).map(|s| s.state) {
            Some(StepState::Completed) => true,
            Some(StepState::Skipped) => continuing,
            Some(StepState::Failed | StepState::TimedOut) => {
                continuing && self.step(dependency).is_some_and(|s| s.continue_on_failure)
            }
            _ => false,
        }
    }

    /// The JSON document conditions are evaluated against.
    pub async fn condition_scope(&self) -> Value {
        let snapshot = self.handle.snapshot().await;
        let outcomes = self.outcomes.lock().await.clone();
        let mut steps = Map::new();
        for status in &snapshot.steps {
            let outcome = outcomes.get(&status.step_id).cloned().unwrap_or_default();
            steps.insert(
                status.step_id.clone(),
                json!({
                    "success": status.state == StepState::Completed,
                    "state": status.state,
                    "output": outcome.output,
                    "error": outcome.error,
                    "attempts": status.attempt,
                }),
            );
        }
        json!({
            "variables": Value::Object(self.variables().await),
            "input": self.context.input,
            "steps": Value::Object(steps),
        })
    }

    /// Evaluates `source` against the current scope.
    ///
    /// # Errors
    /// Returns the parse error message if `source` is not a valid expression.
    pub async fn evaluate(&self, source: &str) -> Result<bool, String> {
        let condition = Condition::parse(source).map_err(|e| e.to_string())?;
        Ok(condition.evaluate(&self.condition_scope().await))
    }

    /// Per-step results in declaration order.
    pub async fn step_results(&self, snapshot: &WorkflowStatus) -> Vec<StepResult> {
        let outcomes = self.outcomes.lock().await;
        snapshot
            .steps
            .iter()
            .map(|status| {
                let outcome = outcomes.get(&status.step_id).cloned().unwrap_or_default();
                StepResult {
                    step_id: status.step_id.clone(),
                    step_name: self
                        .step(&status.step_id)
                        .map(|s| s.name.clone())
                        .unwrap_or_default(),
                    state: status.state,
                    attempts: status.attempt,
                    agent_id: status.agent_id.clone(),
                    output: outcome.output,
                    error: outcome.error,
                    started_at: status.started_at,
                    completed_at: status.completed_at,
                    used_fallback: outcome.used_fallback,
                }
            })
            .collect()
    }

    /// Whether every critical step that is not a fallback completed.
    pub fn critical_steps_completed(&self, snapshot: &WorkflowStatus) -> bool {
        self.definition
            .steps
            .iter()
            .filter(|s| s.is_critical && !self.fallbacks.contains(&s.id))
            .all(|s| snapshot.step(&s.id).is_some_and(|st| st.state == StepState::Completed))
    }

    /// Code and state given to a step stopped by cancellation or the deadline.
    pub fn interruption(&self) -> (StepState, ErrorCode, &'static str) {
        if self.deadline_hit() {
            (StepState::TimedOut, ErrorCode::WorkflowTimeout, "workflow timed out")
        } else {
            (StepState::Failed, ErrorCode::Cancelled, "workflow cancelled")
        }
    }
}
