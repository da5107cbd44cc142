//! Integration tests for the orchestrator facade: lifecycle, cancellation,
//! capacity, events, retention and metrics.

mod common;

use common::{drain, harness, harness_with, step, test_config, worker};
use maestro_agents::{AgentError, AgentType, ScriptedAgent, TaskRequirements, topics};
use maestro_core::{
    ErrorCode, OrchestratorError, StepState, WorkflowContext, WorkflowDefinition, WorkflowState,
    WorkflowType,
};
use std::time::Duration;

fn slow_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("slow", "Slow", WorkflowType::Sequential)
        .with_step(step("s1", "slow"))
        .with_step(step("s2", "slow").depends_on("s1"))
}

async fn wait_for_running(h: &common::Harness, instance_id: &str, step_id: &str) {
    for _ in 0..200 {
        if let Some(status) = h.orchestrator.get_workflow_status(instance_id).await {
            if status.step(step_id).is_some_and(|s| s.state == StepState::Running) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("step {step_id} never started");
}

#[tokio::test]
async fn test_cancel_running_workflow() {
    let h = harness();
    let agent = h.register(worker("sleeper", "slow").with_delay(Duration::from_secs(10))).await;

    let (instance_id, handle) = h.orchestrator.start_workflow(&slow_workflow(), None).await;
    wait_for_running(&h, &instance_id, "s1").await;

    assert!(h.orchestrator.cancel_workflow(&instance_id).await.unwrap());
    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

    assert_eq!(result.state, WorkflowState::Cancelled);
    assert!(!result.success);
    assert_eq!(result.step("s1").unwrap().state, StepState::Failed);
    assert_eq!(result.step("s2").unwrap().state, StepState::Skipped);
    assert!(result.errors_with_code(ErrorCode::Cancelled).count() >= 1);
    assert_eq!(agent.call_count(), 1);

    let status = h.orchestrator.get_workflow_status(&instance_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Cancelled);
    assert!(status.started_at.unwrap() <= status.cancel_requested_at.unwrap());

    // A second request finds the instance already finished.
    assert!(!h.orchestrator.cancel_workflow(&instance_id).await.unwrap());
    assert_eq!(h.orchestrator.active_workflows(), 0);
}

#[tokio::test]
async fn test_status_visible_while_running() {
    let h = harness();
    h.register(worker("sleeper", "slow").with_delay(Duration::from_millis(300))).await;

    let (instance_id, handle) = h.orchestrator.start_workflow(&slow_workflow(), None).await;
    wait_for_running(&h, &instance_id, "s1").await;

    let status = h.orchestrator.get_workflow_status(&instance_id).await.unwrap();
    assert_eq!(status.state, WorkflowState::Running);
    assert_eq!(status.current_step.as_deref(), Some("s1"));
    assert_eq!(status.step("s2").unwrap().state, StepState::NotStarted);
    assert_eq!(h.orchestrator.active_workflows(), 1);

    h.orchestrator.cancel_workflow(&instance_id).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_reused_instance_id_reports_new_run() {
    let h = harness();
    h.register(worker("sleeper", "slow").with_delay(Duration::from_millis(200))).await;
    let def = WorkflowDefinition::new("wf", "Reused", WorkflowType::Sequential)
        .with_step(step("s1", "slow"));

    let first = h
        .orchestrator
        .execute_workflow(&def, Some(WorkflowContext::new().with_instance_id("same")))
        .await;
    assert!(first.success);
    assert_eq!(
        h.orchestrator.get_workflow_status("same").await.unwrap().state,
        WorkflowState::Completed
    );

    let (instance_id, handle) = h
        .orchestrator
        .start_workflow(&def, Some(WorkflowContext::new().with_instance_id("same")))
        .await;
    wait_for_running(&h, &instance_id, "s1").await;
    let status = h.orchestrator.get_workflow_status("same").await.unwrap();
    assert_eq!(status.state, WorkflowState::Running);
    assert!(status.started_at.unwrap() > first.started_at);

    let second = handle.await.unwrap();
    assert!(second.success);
    assert_eq!(
        h.orchestrator.get_workflow_status("same").await.unwrap().state,
        WorkflowState::Completed
    );
}

#[tokio::test]
async fn test_capacity_limit_rejects_extra_workflows() {
    let mut config = test_config();
    config.max_concurrent_workflows = 1;
    let h = harness_with(config);
    h.register(worker("sleeper", "slow").with_delay(Duration::from_secs(10))).await;

    let (first, handle) = h.orchestrator.start_workflow(&slow_workflow(), None).await;

    let rejected = h.orchestrator.execute_workflow(&slow_workflow(), None).await;
    assert!(!rejected.success);
    assert_eq!(rejected.state, WorkflowState::Failed);
    assert_eq!(rejected.errors_with_code(ErrorCode::CapacityExceeded).count(), 1);
    assert!(h.orchestrator.get_workflow_status(&rejected.instance_id).await.is_none());

    h.orchestrator.cancel_workflow(&first).await.unwrap();
    handle.await.unwrap();
    assert_eq!(h.orchestrator.active_workflows(), 0);
}

#[tokio::test]
async fn test_cyclic_definition_never_reaches_agents() {
    let h = harness();
    let agent = h.register(worker("w1", "work")).await;

    let def = WorkflowDefinition::new("wf", "Cycle", WorkflowType::Sequential)
        .with_step(step("a", "work").depends_on("b"))
        .with_step(step("b", "work").depends_on("a"));

    let result = h.orchestrator.execute_workflow(&def, None).await;
    assert!(!result.success);
    assert!(result.errors_with_code(ErrorCode::ValidationFailed).count() >= 1);
    assert!(result.step_results.is_empty());
    assert_eq!(agent.call_count(), 0);
}

#[tokio::test]
async fn test_status_updates_are_published() {
    let h = harness();
    h.register(worker("w1", "work")).await;
    let mut rx = h.orchestrator.subscribe().unwrap();

    let def = WorkflowDefinition::new("wf", "Events", WorkflowType::Sequential)
        .with_step(step("s1", "work"));
    let context = WorkflowContext::new().with_instance_id("evented");
    let result = h.orchestrator.execute_workflow(&def, Some(context)).await;
    assert!(result.success);

    let updates: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|m| m.topic == topics::WORKFLOW_STATUS_UPDATED)
        .filter(|m| m.payload["instance_id"] == "evented")
        .collect();
    assert!(updates.len() >= 3);
    assert_eq!(updates.first().unwrap().payload["state"], "running");
    assert_eq!(updates.last().unwrap().payload["state"], "completed");
    assert_eq!(updates.last().unwrap().payload["progress"], 1.0);
}

#[tokio::test]
async fn test_terminal_statuses_are_purged_beyond_retention() {
    let mut config = test_config();
    config.engine.max_retained_statuses = 1;
    let h = harness_with(config);
    h.register(worker("w1", "work")).await;

    let def = WorkflowDefinition::new("wf", "Retained", WorkflowType::Sequential)
        .with_step(step("s1", "work"));
    let first = h
        .orchestrator
        .execute_workflow(&def, Some(WorkflowContext::new().with_instance_id("first")))
        .await;
    let second = h
        .orchestrator
        .execute_workflow(&def, Some(WorkflowContext::new().with_instance_id("second")))
        .await;
    assert!(first.success && second.success);

    assert!(h.orchestrator.get_workflow_status("first").await.is_none());
    assert!(h.orchestrator.get_workflow_status("second").await.is_some());
    assert!(matches!(
        h.orchestrator.cancel_workflow("first").await,
        Err(OrchestratorError::WorkflowNotFound(_))
    ));
}

#[tokio::test]
async fn test_metrics_follow_configuration() {
    let h = harness();
    h.register(worker("w1", "work")).await;
    let def = WorkflowDefinition::new("wf", "Metrics", WorkflowType::Sequential)
        .with_step(step("s1", "work"));

    assert!(h.orchestrator.execute_workflow(&def, None).await.success);
    assert_eq!(h.metrics.counter("workflows.started"), 1);
    assert_eq!(h.metrics.counter("workflows.completed"), 1);
    assert_eq!(h.metrics.counter("steps.attempts"), 1);
    assert!(h.metrics.timing("workflow.duration").is_some());

    let mut config = test_config();
    config.enable_metrics = false;
    h.orchestrator.configure(config).await.unwrap();

    assert!(h.orchestrator.execute_workflow(&def, None).await.success);
    assert_eq!(h.metrics.counter("workflows.started"), 1);
    assert_eq!(h.metrics.counter("steps.attempts"), 1);
}

#[tokio::test]
async fn test_assign_task_prefers_matching_skill() {
    let h = harness();
    h.register(ScriptedAgent::new("a1", AgentType::Reactive).with_skill("weather", 0.9)).await;
    h.register(ScriptedAgent::new("a2", AgentType::Reactive).with_skill("finance", 0.9)).await;

    let agent = h.orchestrator.assign_task("Check the weather in Oslo", None).await.unwrap();
    assert_eq!(agent.id(), "a1");

    let requirements = TaskRequirements::for_type(AgentType::Bdi);
    let err = h
        .orchestrator
        .assign_task("Check the weather in Oslo", Some(&requirements))
        .await
        .err().unwrap();
    assert!(matches!(err, OrchestratorError::Agent(AgentError::NoSuitableAgent(_))));
}

#[tokio::test]
async fn test_unregistered_agent_is_not_selected() {
    let h = harness();
    h.register(worker("w1", "work")).await;
    assert!(h.orchestrator.unregister_agent("w1").await);
    assert!(!h.orchestrator.unregister_agent("w1").await);

    let def = WorkflowDefinition::new("wf", "Orphan", WorkflowType::Sequential)
        .with_step(step("s1", "work"));
    let result = h.orchestrator.execute_workflow(&def, None).await;
    assert_eq!(result.errors_with_code(ErrorCode::NoSuitableAgent).count(), 1);
}
