//! Integration tests for registry-backed task assignment.

use maestro_agents::{
    AgentError, AgentRegistry, AgentType, BroadcastBus, InMemoryMetrics, KeywordGuardrail,
    ScriptedAgent, TaskRequirements, TaskSelector, WeightedScoring, topics,
};
use std::sync::Arc;

struct Fixture {
    registry: Arc<AgentRegistry>,
    selector: TaskSelector,
    bus: Arc<BroadcastBus>,
    metrics: Arc<InMemoryMetrics>,
}

fn fixture() -> Fixture {
    let bus = Arc::new(BroadcastBus::new(64));
    let metrics = Arc::new(InMemoryMetrics::new());
    let registry = Arc::new(AgentRegistry::with_collaborators(bus.clone(), metrics.clone()));
    let selector = TaskSelector::new(
        Arc::clone(&registry),
        Arc::new(KeywordGuardrail::new(["delete everything"])),
        Arc::new(WeightedScoring::default()),
        bus.clone(),
        metrics.clone(),
    );
    Fixture { registry, selector, bus, metrics }
}

#[tokio::test]
async fn test_weather_agent_wins_among_several() {
    let f = fixture();
    f.registry
        .register(Arc::new(
            ScriptedAgent::new("a1", AgentType::Reactive)
                .with_skill("weather", 0.9)
                .with_load(0.1)
                .with_performance(0.8),
        ))
        .await
        .unwrap();
    f.registry
        .register(Arc::new(
            ScriptedAgent::new("b1", AgentType::UtilityBased)
                .with_skill("travel", 1.0)
                .with_load(0.0)
                .with_performance(1.0),
        ))
        .await
        .unwrap();
    f.registry
        .register(Arc::new(
            ScriptedAgent::new("c1", AgentType::Hybrid).with_load(0.0).with_performance(1.0),
        ))
        .await
        .unwrap();

    let chosen = f.selector.assign("what's the weather today?", None).await.unwrap();
    assert_eq!(chosen.id(), "a1");
    assert_eq!(f.metrics.counter("tasks.assigned"), 1);
    assert_eq!(f.metrics.counter("agents.registered"), 3);
}

#[tokio::test]
async fn test_unregistered_agent_no_longer_selected() {
    let f = fixture();
    f.registry
        .register(Arc::new(ScriptedAgent::new("only", AgentType::Bdi)))
        .await
        .unwrap();

    let requirements = TaskRequirements::for_type(AgentType::Bdi);
    assert_eq!(f.selector.assign("plan", Some(&requirements)).await.unwrap().id(), "only");

    assert!(f.registry.unregister("only").await);
    let err = f.selector.assign("plan", Some(&requirements)).await.err().unwrap();
    assert!(matches!(err, AgentError::NoSuitableAgent(_)));
}

#[tokio::test]
async fn test_event_sequence() {
    let f = fixture();
    let mut rx = f.bus.subscribe();

    f.registry
        .register(Arc::new(ScriptedAgent::new("a1", AgentType::Reactive)))
        .await
        .unwrap();
    let _ = f.selector.assign("delete everything now", None).await.err().unwrap();
    f.selector.assign("tidy up", None).await.unwrap();
    f.registry.unregister("a1").await;

    let mut seen = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        seen.push(msg.topic);
    }
    assert_eq!(
        seen,
        vec![topics::AGENT_REGISTERED, topics::TASK_ASSIGNED, topics::AGENT_UNREGISTERED]
    );
}
