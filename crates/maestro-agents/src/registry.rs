//! Agent registry for managing live agents.
//!
//! This module provides functionality to register, retrieve, list, and
//! unregister agents. Registry changes are announced on the message bus
//! after the internal lock has been released.

use crate::bus::{BusMessage, MessageBus, NoopBus, publish_logged, topics};
use crate::error::{AgentError, Result};
use crate::metrics::{MetricsRecorder, NoopMetrics};
use crate::{Agent, AgentInfo};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Registry for managing agents.
pub struct AgentRegistry {
    /// Map of agent ID to agent instance, ordered by id.
    agents: Arc<RwLock<BTreeMap<String, Arc<dyn Agent>>>>,
    /// Where registration events go.
    bus: Arc<dyn MessageBus>,
    /// Registration counters.
    metrics: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agent_count", &self.agents.try_read().map(|a| a.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl AgentRegistry {
    /// Creates a new empty agent registry that publishes nowhere.
    #[must_use]
    pub fn new() -> Self {
        Self::with_collaborators(Arc::new(NoopBus), Arc::new(NoopMetrics))
    }

    /// Creates a new empty registry wired to `bus` and `metrics`.
    #[must_use]
    pub fn with_collaborators(bus: Arc<dyn MessageBus>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { agents: Arc::new(RwLock::new(BTreeMap::new())), bus, metrics }
    }

    /// Registers an agent in the registry.
    ///
    /// # Arguments
    /// * `agent` - The agent to register
    ///
    /// # Errors
    /// Returns `AgentError::DuplicateAgent` if an agent with the same id is
    /// already registered; the registry is left unchanged.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let id = agent.id().to_string();

        debug!(agent_id = %id, "Registering agent");

        let info = {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&id) {
                warn!(agent_id = %id, "Rejected duplicate agent registration");
                return Err(AgentError::DuplicateAgent(id));
            }
            let info = AgentInfo::of(agent.as_ref());
            agents.insert(id.clone(), agent);
            info
        };

        info!(agent_id = %id, agent_type = %info.agent_type, "Agent registered");
        self.metrics.increment("agents.registered", 1);
        publish_logged(
            self.bus.as_ref(),
            BusMessage::new(topics::AGENT_REGISTERED, serde_json::to_value(&info).unwrap_or_default()),
        )
        .await;

        Ok(())
    }

    /// Unregisters an agent from the registry.
    ///
    /// # Arguments
    /// * `id` - The agent ID to unregister
    ///
    /// # Returns
    /// Returns `true` if the agent was found and removed, `false` otherwise.
    pub async fn unregister(&self, id: &str) -> bool {
        debug!(agent_id = %id, "Unregistering agent");

        let removed = self.agents.write().await.remove(id).is_some();

        if !removed {
            warn!(agent_id = %id, "Attempted to unregister non-existent agent");
            return false;
        }

        info!(agent_id = %id, "Agent unregistered");
        self.metrics.increment("agents.unregistered", 1);
        publish_logged(
            self.bus.as_ref(),
            BusMessage::new(topics::AGENT_UNREGISTERED, serde_json::json!({ "agent_id": id })),
        )
        .await;

        true
    }

    /// Retrieves an agent by ID.
    pub async fn get(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(id).cloned()
    }

    /// Returns a snapshot of every registered agent, ordered by id.
    pub async fn list(&self) -> Vec<Arc<dyn Agent>> {
        self.agents.read().await.values().cloned().collect()
    }

    /// Returns serializable snapshots of every registered agent.
    pub async fn list_info(&self) -> Vec<AgentInfo> {
        self.list().await.iter().map(|a| AgentInfo::of(a.as_ref())).collect()
    }

    /// Checks if an agent is registered.
    pub async fn is_registered(&self, id: &str) -> bool {
        self.agents.read().await.contains_key(id)
    }

    /// Returns the number of registered agents.
    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BroadcastBus;
    use crate::{AgentType, ScriptedAgent};

    fn agent(id: &str) -> Arc<dyn Agent> {
        Arc::new(ScriptedAgent::new(id, AgentType::Reactive))
    }

    #[tokio::test]
    async fn test_register_agent() {
        let registry = AgentRegistry::new();
        registry.register(agent("test-agent")).await.unwrap();
        assert_eq!(registry.count().await, 1);
        assert!(registry.is_registered("test-agent").await);
    }

    #[tokio::test]
    async fn test_register_duplicate_agent_leaves_registry_unchanged() {
        let registry = AgentRegistry::new();
        let original = Arc::new(ScriptedAgent::new("test-agent", AgentType::Reactive).with_name("first"));
        registry.register(original).await.unwrap();

        let duplicate = Arc::new(ScriptedAgent::new("test-agent", AgentType::Bdi).with_name("second"));
        let err = registry.register(duplicate).await.unwrap_err();
        assert_eq!(err, AgentError::DuplicateAgent("test-agent".to_string()));

        assert_eq!(registry.count().await, 1);
        let kept = registry.get("test-agent").await.unwrap();
        assert_eq!(kept.name(), "first");
        assert_eq!(kept.agent_type(), AgentType::Reactive);
    }

    #[tokio::test]
    async fn test_get_nonexistent_agent() {
        let registry = AgentRegistry::new();
        assert!(registry.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id() {
        let registry = AgentRegistry::new();
        registry.register(agent("b")).await.unwrap();
        registry.register(agent("a")).await.unwrap();
        registry.register(agent("c")).await.unwrap();

        let ids: Vec<String> = registry.list().await.iter().map(|a| a.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_unregister_missing_is_noop() {
        let registry = AgentRegistry::new();
        registry.register(agent("a")).await.unwrap();
        assert!(!registry.unregister("missing").await);
        assert_eq!(registry.count().await, 1);
        assert!(registry.unregister("a").await);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = Arc::new(BroadcastBus::new(16));
        let mut rx = bus.subscribe();
        let registry = AgentRegistry::with_collaborators(bus.clone(), Arc::new(NoopMetrics));

        registry.register(agent("a1")).await.unwrap();
        registry.unregister("a1").await;
        registry.unregister("a1").await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, topics::AGENT_REGISTERED);
        assert_eq!(first.payload["id"], "a1");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, topics::AGENT_UNREGISTERED);
        assert_eq!(second.payload["agent_id"], "a1");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_registration_admits_one() {
        let registry = Arc::new(AgentRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.register(agent("same")).await }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(registry.count().await, 1);
    }
}
