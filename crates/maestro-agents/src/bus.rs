//! Message bus seam.
//!
//! The orchestrator announces registry changes, task assignments and
//! workflow status updates on a pub/sub bus. The bus itself is an external
//! collaborator; this module defines the trait plus an in-process
//! broadcast implementation and a no-op one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Well-known topic names.
pub mod topics {
    /// An agent was added to the registry.
    pub const AGENT_REGISTERED: &str = "agent.registered";
    /// An agent was removed from the registry.
    pub const AGENT_UNREGISTERED: &str = "agent.unregistered";
    /// A task was assigned to an agent.
    pub const TASK_ASSIGNED: &str = "task.assigned";
    /// A workflow instance's status changed.
    pub const WORKFLOW_STATUS_UPDATED: &str = "workflow.status.updated";
}

/// Envelope published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message is published on.
    pub topic: String,
    /// Message body.
    pub payload: serde_json::Value,
    /// Publication time.
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { topic: topic.into(), payload, timestamp: Utc::now() }
    }
}

/// Failure reported by a bus implementation.
#[derive(Debug, Clone, Error)]
#[error("Message bus publish failed on '{topic}': {reason}")]
pub struct BusError {
    /// Topic of the message that could not be published.
    pub topic: String,
    /// Why it failed.
    pub reason: String,
}

/// At-least-once publish/subscribe transport.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes `message`.
    async fn publish(&self, message: BusMessage) -> std::result::Result<(), BusError>;
}

/// Publishes `message` and logs instead of failing.
///
/// Callers must not be holding any lock when they call this.
pub async fn publish_logged(bus: &dyn MessageBus, message: BusMessage) {
    let topic = message.topic.clone();
    if let Err(e) = bus.publish(message).await {
        warn!(topic = %topic, error = %e, "Failed to publish bus message");
    }
}

/// Bus that drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

#[async_trait]
impl MessageBus for NoopBus {
    async fn publish(&self, _message: BusMessage) -> std::result::Result<(), BusError> {
        Ok(())
    }
}

/// In-process fan-out bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    /// Creates a bus whose subscribers buffer up to `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, message: BusMessage) -> std::result::Result<(), BusError> {
        debug!(topic = %message.topic, "Publishing bus message");
        // No subscribers is not a failure.
        let _ = self.sender.send(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingBus;

    #[async_trait]
    impl MessageBus for FailingBus {
        async fn publish(&self, message: BusMessage) -> std::result::Result<(), BusError> {
            Err(BusError { topic: message.topic, reason: "offline".to_string() })
        }
    }

    #[tokio::test]
    async fn test_broadcast_bus_delivers_to_subscribers() {
        let bus = BroadcastBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(BusMessage::new(topics::TASK_ASSIGNED, serde_json::json!({"agent_id": "a1"})))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "task.assigned");
        assert_eq!(msg.payload["agent_id"], "a1");
    }

    #[tokio::test]
    async fn test_broadcast_bus_without_subscribers_is_ok() {
        let bus = BroadcastBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.publish(BusMessage::new("x", serde_json::Value::Null)).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_logged_swallows_errors() {
        publish_logged(&FailingBus, BusMessage::new("x", serde_json::Value::Null)).await;
    }
}
