//! Runs a single step: dependency and condition gates, agent resolution,
//! attempts with retry and timeout, the alternative agent, fallback steps
//! and nested workflows.

use crate::models::{ErrorCode, ErrorHandlingMode, ErrorSeverity, StepState, WorkflowError, WorkflowStep};
use crate::workflow::run::{Run, StepOutcome};
use futures::FutureExt;
use maestro_agents::{Agent, AgentRequest, MetricsRecorder, rank_candidates};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// How one attempt ended.
enum Attempt {
    Succeeded(Value),
    Failed(String),
    TimedOut(String),
    Interrupted,
}

/// How a step's attempts ended.
enum Performed {
    Succeeded { output: Value },
    Failed { code: ErrorCode, message: String, timed_out: bool },
    /// Cancellation or the workflow deadline stopped the step mid-flight.
    Interrupted,
    /// The step could not enter `Running` because the run was cancelled.
    Refused,
}

/// Runs `step_id` and returns its state afterwards.
///
/// A panic inside the step is caught and recorded as an internal error.
pub(crate) async fn execute_guarded(run: &Arc<Run>, step_id: &str) -> StepState {
    let result = AssertUnwindSafe(execute(run, step_id)).catch_unwind().await;
    match result {
        Ok(state) => state,
        Err(_) => {
            error!(instance_id = %run.context.instance_id, step_id = %step_id, "Step panicked");
            run.record_error(
                WorkflowError::new(ErrorCode::InternalError, "step panicked", ErrorSeverity::Critical)
                    .for_step(step_id),
            )
            .await;
            run.set_outcome(
                step_id,
                StepOutcome { error: Some("step panicked".into()), ..StepOutcome::default() },
            )
            .await;
            run.handle
                .transition_step(step_id, StepState::Failed, |s| {
                    s.message = Some("step panicked".into());
                })
                .await;
            run.halt();
            StepState::Failed
        }
    }
}

async fn execute(run: &Arc<Run>, step_id: &str) -> StepState {
    let Some(step) = run.step(step_id) else {
        return StepState::Skipped;
    };

    if let Some(dependency) = run.unsatisfied_dependency(step).await {
        let message = format!("dependency '{dependency}' not satisfied");
        run.record_error(
            WorkflowError::new(ErrorCode::DependencyNotSatisfied, &message, ErrorSeverity::Warning)
                .for_step(step_id),
        )
        .await;
        return skip(run, step_id, message).await;
    }

    if let Some(condition) = &step.condition {
        match run.evaluate(condition).await {
            Ok(true) => {}
            Ok(false) => return skip(run, step_id, format!("condition '{condition}' not met")).await,
            Err(reason) => {
                let message = format!("invalid condition '{condition}': {reason}");
                return settle_failure(run, step, ErrorCode::StepExecutionFailed, message, false).await;
            }
        }
    }

    run.log_step(step_id, "Dispatching step");
    match perform(run, step).await {
        Performed::Succeeded { output } => {
            complete(run, step_id, output, None).await;
            StepState::Completed
        }
        Performed::Failed { code, message, timed_out } => match &step.fallback_step_id {
            Some(fallback_id) => run_fallback(run, step, fallback_id, code, message, timed_out).await,
            None => settle_failure(run, step, code, message, timed_out).await,
        },
        Performed::Interrupted => settle_interrupted(run, step_id).await,
        Performed::Refused => current_state(run, step_id).await,
    }
}

async fn run_fallback(
    run: &Arc<Run>,
    step: &WorkflowStep,
    fallback_id: &str,
    code: ErrorCode,
    message: String,
    timed_out: bool,
) -> StepState {
    let Some(fallback) = run.step(fallback_id) else {
        return settle_failure(run, step, code, message, timed_out).await;
    };
    if !run.claim_fallback(fallback_id).await {
        warn!(
            instance_id = %run.context.instance_id,
            step_id = %step.id,
            fallback = %fallback_id,
            "Fallback step already used by another step"
        );
        let message = format!("{message}; fallback '{fallback_id}' was already used");
        return settle_failure(run, step, code, message, timed_out).await;
    }

    info!(
        instance_id = %run.context.instance_id,
        step_id = %step.id,
        fallback = %fallback_id,
        "Running fallback step"
    );
    run.handle
        .transition_step(&step.id, StepState::Waiting, |s| {
            s.message = Some(format!("running fallback '{fallback_id}' after: {message}"));
        })
        .await;

    match perform(run, fallback).await {
        Performed::Succeeded { output } => {
            complete(run, &fallback.id, output.clone(), None).await;
            run.record_error(
                WorkflowError::new(code, format!("replaced by fallback '{fallback_id}': {message}"), ErrorSeverity::Warning)
                    .for_step(&step.id),
            )
            .await;
            complete(run, &step.id, output, Some(fallback_id.to_string())).await;
            StepState::Completed
        }
        Performed::Failed { code: fallback_code, message: fallback_message, timed_out: fallback_timed_out } => {
            record_failure(run, fallback, fallback_code, &fallback_message, fallback_timed_out).await;
            settle_failure(
                run,
                step,
                code,
                format!("{message}; fallback '{fallback_id}' failed: {fallback_message}"),
                timed_out,
            )
            .await
        }
        Performed::Interrupted => {
            settle_interrupted(run, &fallback.id).await;
            settle_interrupted(run, &step.id).await
        }
        Performed::Refused => current_state(run, &step.id).await,
    }
}

/// Runs the attempts of `step` without settling it.
async fn perform(run: &Arc<Run>, step: &WorkflowStep) -> Performed {
    if step.sub_workflow.is_some() {
        return attempts(run, step, None).await;
    }

    let agents = run.engine.registry().list().await;
    let ranked = rank_candidates(
        &agents,
        &step.description(),
        &step.requirements(),
        run.engine.scoring().as_ref(),
    );
    let Some(primary) = ranked.first() else {
        return Performed::Failed {
            code: ErrorCode::NoSuitableAgent,
            message: format!(
                "no registered agent matches step '{}' (type {}, capabilities [{}])",
                step.id,
                step.required_agent_type.as_ref().map_or_else(|| "any".to_string(), ToString::to_string),
                step.required_capabilities.iter().cloned().collect::<Vec<_>>().join(", "),
            ),
            timed_out: false,
        };
    };

    let performed = attempts(run, step, Some(Arc::clone(&primary.agent))).await;
    let Performed::Failed { .. } = performed else {
        return performed;
    };

    match (run.mode, ranked.get(1)) {
        (ErrorHandlingMode::UseAlternative, Some(alternative)) => {
            info!(
                step_id = %step.id,
                agent_id = %alternative.agent.id(),
                "Trying alternative agent"
            );
            let attempt = run.handle.snapshot().await.step(&step.id).map_or(1, |s| s.attempt + 1);
            match single_attempt(run, step, Some(Arc::clone(&alternative.agent)), attempt).await {
                Some(Attempt::Succeeded(output)) => Performed::Succeeded { output },
                Some(Attempt::Failed(message)) => {
                    Performed::Failed { code: ErrorCode::StepExecutionFailed, message, timed_out: false }
                }
                Some(Attempt::TimedOut(message)) => {
                    Performed::Failed { code: ErrorCode::StepTimeout, message, timed_out: true }
                }
                Some(Attempt::Interrupted) => Performed::Interrupted,
                None => Performed::Refused,
            }
        }
        _ => performed,
    }
}

async fn attempts(run: &Arc<Run>, step: &WorkflowStep, agent: Option<Arc<dyn Agent>>) -> Performed {
    let (retries, delay) = run.retry_policy(step);
    let token = run.handle.token().clone();
    let mut last = Performed::Refused;

    for attempt in 1..=retries + 1 {
        if attempt > 1 {
            let reason = match &last {
                Performed::Failed { message, .. } => message.clone(),
                _ => String::new(),
            };
            run.handle
                .transition_step(&step.id, StepState::Waiting, |s| {
                    s.message = Some(format!("retrying after: {reason}"));
                })
                .await;
            run.log_step(&step.id, "Waiting before retry");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => return Performed::Interrupted,
            }
        }

        last = match single_attempt(run, step, agent.clone(), attempt).await {
            Some(Attempt::Succeeded(output)) => return Performed::Succeeded { output },
            Some(Attempt::Interrupted) => return Performed::Interrupted,
            None => return Performed::Refused,
            Some(Attempt::Failed(message)) => {
                warn!(step_id = %step.id, attempt, error = %message, "Step attempt failed");
                Performed::Failed { code: ErrorCode::StepExecutionFailed, message, timed_out: false }
            }
            Some(Attempt::TimedOut(message)) => {
                warn!(step_id = %step.id, attempt, error = %message, "Step attempt timed out");
                Performed::Failed { code: ErrorCode::StepTimeout, message, timed_out: true }
            }
        };
    }
    last
}

/// Moves the step to `Running` and makes one attempt.
///
/// Returns `None` if the step may no longer start.
async fn single_attempt(
    run: &Arc<Run>,
    step: &WorkflowStep,
    agent: Option<Arc<dyn Agent>>,
    attempt: u32,
) -> Option<Attempt> {
    let agent_id = agent.as_ref().map(|a| a.id().to_string());
    let started = run
        .handle
        .transition_step(&step.id, StepState::Running, |s| {
            s.attempt = attempt;
            s.agent_id.clone_from(&agent_id);
            s.message = None;
        })
        .await;
    if !started {
        return None;
    }
    run.log_step(&step.id, "Step attempt started");
    run.engine.metrics().increment("steps.attempts", 1);

    let started_at = Instant::now();
    let outcome = match agent {
        Some(agent) => invoke_agent(run, step, agent.as_ref(), attempt).await,
        None => invoke_sub_workflow(run, step).await,
    };
    run.engine.metrics().record_duration("step.duration", started_at.elapsed());

    if run.handle.token().is_cancelled() {
        return Some(Attempt::Interrupted);
    }
    Some(outcome)
}

async fn invoke_agent(run: &Arc<Run>, step: &WorkflowStep, agent: &dyn Agent, attempt: u32) -> Attempt {
    let token = run.handle.token().clone();
    let request_token = token.child_token();
    let request = AgentRequest {
        description: step.description(),
        inputs: run.step_inputs(step).await,
        instance_id: Some(run.context.instance_id.clone()),
        step_id: Some(step.id.clone()),
        correlation_id: Some(run.context.correlation_id.clone()),
        attempt,
        cancellation: request_token.clone(),
    };
    let timeout = run.step_timeout(step);

    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, agent.decide_and_execute(request)) => match result {
            Ok(action) if action.success => {
                run.merge_variables(action.variable_updates).await;
                Attempt::Succeeded(action.output)
            }
            Ok(action) => Attempt::Failed(
                action.error.unwrap_or_else(|| format!("agent '{}' reported failure", agent.id())),
            ),
            Err(_) => Attempt::TimedOut(format!("attempt {attempt} exceeded {}ms", timeout.as_millis())),
        },
        () = token.cancelled() => Attempt::Interrupted,
    };
    request_token.cancel();
    outcome
}

async fn invoke_sub_workflow(run: &Arc<Run>, step: &WorkflowStep) -> Attempt {
    let Some(definition) = step.sub_workflow.as_deref() else {
        return Attempt::Failed(format!("step '{}' has no sub-workflow", step.id));
    };
    let context = run.context.child(&step.id, run.step_inputs(step).await);
    let timeout = run.step_timeout(step);
    let attempt_token = run.handle.token().child_token();
    let mut nested = run.engine.run_nested(definition.clone(), context, attempt_token.clone());

    let Ok(result) = tokio::time::timeout(timeout, &mut nested).await else {
        // The nested instance must settle before a retry can reuse its id.
        attempt_token.cancel();
        let grace = run.config.cancellation_grace() * 2;
        if tokio::time::timeout(grace, nested).await.is_err() {
            warn!(
                instance_id = %run.context.instance_id,
                step_id = %step.id,
                grace_ms = grace.as_millis(),
                "Sub-workflow still running after cancellation"
            );
        }
        return Attempt::TimedOut(format!(
            "sub-workflow '{}' exceeded {}ms",
            definition.id,
            timeout.as_millis()
        ));
    };

    if result.success {
        let outputs: serde_json::Map<String, Value> = result
            .step_results
            .iter()
            .map(|r| (r.step_id.clone(), r.output.clone()))
            .collect();
        run.merge_variables(result.variables).await;
        Attempt::Succeeded(json!({
            "instance_id": result.instance_id,
            "state": result.state,
            "steps": outputs,
        }))
    } else {
        let reasons: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        Attempt::Failed(format!(
            "sub-workflow '{}' ended {}: {}",
            definition.id,
            result.state,
            reasons.join("; ")
        ))
    }
}

async fn complete(run: &Arc<Run>, step_id: &str, output: Value, used_fallback: Option<String>) {
    let note = used_fallback.as_ref().map(|f| format!("completed by fallback '{f}'"));
    run.set_outcome(step_id, StepOutcome { output, error: None, used_fallback }).await;
    run.handle
        .transition_step(step_id, StepState::Completed, |s| s.message = note)
        .await;
    run.log_step(step_id, "Step completed");
}

async fn skip(run: &Arc<Run>, step_id: &str, reason: String) -> StepState {
    run.log_step(step_id, "Step skipped");
    run.handle
        .transition_step(step_id, StepState::Skipped, |s| s.message = Some(reason))
        .await;
    StepState::Skipped
}

/// Records `step`'s failure and settles it.
async fn record_failure(
    run: &Arc<Run>,
    step: &WorkflowStep,
    code: ErrorCode,
    message: &str,
    timed_out: bool,
) -> StepState {
    let state = if timed_out { StepState::TimedOut } else { StepState::Failed };
    let severity = if step.is_critical { ErrorSeverity::Critical } else { ErrorSeverity::Error };
    run.record_error(WorkflowError::new(code, message, severity).for_step(&step.id)).await;
    run.set_outcome(&step.id, StepOutcome { error: Some(message.to_string()), ..StepOutcome::default() })
        .await;
    run.handle
        .transition_step(&step.id, state, |s| s.message = Some(message.to_string()))
        .await;
    run.engine.metrics().increment("steps.failed", 1);
    state
}

/// Settles a failed step and applies the run's failure policy.
async fn settle_failure(
    run: &Arc<Run>,
    step: &WorkflowStep,
    code: ErrorCode,
    message: String,
    timed_out: bool,
) -> StepState {
    let state = record_failure(run, step, code, &message, timed_out).await;
    if !step.continue_on_failure && run.mode.stops_on_failure() {
        info!(
            instance_id = %run.context.instance_id,
            step_id = %step.id,
            mode = ?run.mode,
            "Stopping dispatch after step failure"
        );
        run.halt();
    }
    state
}

/// Settles a step stopped by cancellation or the workflow deadline.
pub(crate) async fn settle_interrupted(run: &Arc<Run>, step_id: &str) -> StepState {
    let (state, code, message) = run.interruption();
    run.record_error(WorkflowError::new(code, message, ErrorSeverity::Error).for_step(step_id)).await;
    run.set_outcome(step_id, StepOutcome { error: Some(message.to_string()), ..StepOutcome::default() })
        .await;
    run.handle
        .transition_step(step_id, state, |s| s.message = Some(message.to_string()))
        .await;
    state
}

/// Settles a step the scheduler left behind although the run was neither
/// cancelled nor timed out.
pub(crate) async fn settle_stranded(run: &Arc<Run>, step_id: &str) -> StepState {
    let message = "step never settled";
    error!(instance_id = %run.context.instance_id, step_id = %step_id, "Step left unsettled");
    run.record_error(
        WorkflowError::new(ErrorCode::InternalError, message, ErrorSeverity::Critical).for_step(step_id),
    )
    .await;
    run.set_outcome(step_id, StepOutcome { error: Some(message.to_string()), ..StepOutcome::default() })
        .await;
    run.handle
        .transition_step(step_id, StepState::Failed, |s| s.message = Some(message.to_string()))
        .await;
    run.halt();
    StepState::Failed
}

async fn current_state(run: &Arc<Run>, step_id: &str) -> StepState {
    run.handle.snapshot().await.step(step_id).map_or(StepState::NotStarted, |s| s.state)
}
