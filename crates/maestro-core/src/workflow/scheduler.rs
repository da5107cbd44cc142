//! One scheduler per workflow type.
//!
//! Sequential and conditional runs walk the dependency order one step at a
//! time. Parallel and hierarchical runs keep a ready set and dispatch every
//! ready step onto a `JoinSet`, bounded by a semaphore. Feedback-loop runs
//! walk the dependency order and jump back along feedback edges.

use crate::models::{StepState, WorkflowType};
use crate::workflow::run::Run;
use crate::workflow::step::execute_guarded;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Schedules every step of `run` according to its workflow type.
///
/// Returns once nothing is left to dispatch and every dispatched step has
/// returned. Dropping the future aborts any step still in flight.
pub(crate) async fn schedule(run: Arc<Run>) {
    match run.definition.workflow_type {
        WorkflowType::Sequential => run_in_order(run).await,
        WorkflowType::Conditional => run_conditional(run).await,
        WorkflowType::Parallel | WorkflowType::Hierarchical => run_ready_set(run).await,
        WorkflowType::FeedbackLoop => run_with_feedback(run).await,
    }
}

fn dispatchable(run: &Run) -> Vec<String> {
    run.order.iter().filter(|id| !run.fallbacks.contains(*id)).cloned().collect()
}

async fn run_in_order(run: Arc<Run>) {
    for step_id in dispatchable(&run) {
        if run.is_halted() {
            break;
        }
        execute_guarded(&run, &step_id).await;
    }
}

/// Conditions are checked right before each step runs, so every condition
/// sees the results of all steps ordered before it.
async fn run_conditional(run: Arc<Run>) {
    run_in_order(run).await;
}

async fn run_ready_set(run: Arc<Run>) {
    let semaphore = Arc::new(Semaphore::new(run.config.max_concurrent_steps.max(1)));
    let mut pending = dispatchable(&run);
    let mut tasks = JoinSet::new();

    loop {
        if !run.is_halted() && !pending.is_empty() {
            let snapshot = run.handle.snapshot().await;
            let (ready, blocked): (Vec<String>, Vec<String>) =
                pending.into_iter().partition(|id| {
                    run.step(id).is_some_and(|step| {
                        step.dependencies.iter().all(|dependency| {
                            snapshot.step(dependency).is_some_and(|s| s.state.is_settled())
                        })
                    })
                });
            pending = blocked;

            if !ready.is_empty() {
                debug!(
                    instance_id = %run.context.instance_id,
                    ready = ready.len(),
                    pending = pending.len(),
                    "Dispatching ready steps"
                );
            }
            for step_id in ready {
                let run = Arc::clone(&run);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    dispatch_with_permit(&run, &step_id, &semaphore).await;
                });
            }
        }

        match tasks.join_next().await {
            Some(Ok(())) => {}
            Some(Err(e)) => warn!(error = %e, "Step task ended abnormally"),
            None => break,
        }
    }

    if !pending.is_empty() && !run.is_halted() {
        warn!(
            instance_id = %run.context.instance_id,
            steps = ?pending,
            "Steps left without settled dependencies"
        );
    }
}

async fn dispatch_with_permit(run: &Arc<Run>, step_id: &str, semaphore: &Arc<Semaphore>) {
    let permit = match Arc::clone(semaphore).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            run.handle
                .transition_step(step_id, StepState::Waiting, |s| {
                    s.message = Some("waiting for a concurrency slot".into());
                })
                .await;
            let token = run.handle.token().clone();
            tokio::select! {
                permit = Arc::clone(semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                () = token.cancelled() => return,
            }
        }
    };

    if run.is_halted() {
        if !run.handle.token().is_cancelled() {
            run.handle
                .transition_step(step_id, StepState::Skipped, |s| {
                    s.message = Some("workflow stopped before the step started".into());
                })
                .await;
        }
        return;
    }

    execute_guarded(run, step_id).await;
    drop(permit);
}

async fn run_with_feedback(run: Arc<Run>) {
    let order = dispatchable(&run);
    let mut reentries: HashMap<String, u32> = HashMap::new();
    let mut index = 0;

    while index < order.len() {
        if run.is_halted() {
            break;
        }
        let step_id = &order[index];
        let state = execute_guarded(&run, step_id).await;

        let edge = run.step(step_id).and_then(|s| s.feedback.clone());
        if let (StepState::Completed, Some(edge)) = (state, edge) {
            let cap = edge.max_iterations.min(run.config.max_feedback_iterations);
            let used = reentries.entry(step_id.clone()).or_default();
            let target = order.iter().position(|id| *id == edge.target).filter(|t| *t <= index);

            match target {
                Some(target) if *used < cap => {
                    let loop_again = match run.evaluate(&edge.condition).await {
                        Ok(value) => value,
                        Err(reason) => {
                            warn!(step_id = %step_id, reason = %reason, "Invalid feedback condition");
                            false
                        }
                    };
                    if loop_again {
                        *used += 1;
                        info!(
                            instance_id = %run.context.instance_id,
                            from = %step_id,
                            to = %edge.target,
                            iteration = *used,
                            "Re-entering feedback loop"
                        );
                        for reentered in &order[target..=index] {
                            run.clear_outcome(reentered).await;
                            run.handle.reenter_step(reentered).await;
                        }
                        index = target;
                        continue;
                    }
                }
                Some(_) => debug!(step_id = %step_id, cap, "Feedback iteration cap reached"),
                None => {}
            }
        }
        index += 1;
    }
}
