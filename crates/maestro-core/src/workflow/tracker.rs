//! Per-instance workflow status tracking.
//!
//! Every running instance owns one [`WorkflowStatus`] behind its own lock,
//! together with the cancellation token for the run. Updates go through a
//! [`StatusHandle`]: the lock is taken, the status mutated and cloned, the
//! lock released, and only then is the snapshot published on the bus.

use crate::models::{StepState, StepStatus, WorkflowStatus};
use chrono::{DateTime, Utc};
use maestro_agents::{BusMessage, MessageBus, publish_logged, topics};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors raised by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// An instance with the same id is still running.
    #[error("workflow instance '{0}' is already running")]
    InstanceActive(String),
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The instance was running and has been signalled.
    Signalled,
    /// The instance had already finished; nothing changed.
    AlreadyTerminal,
    /// No such instance.
    NotFound,
}

struct TrackedInstance {
    status: Mutex<WorkflowStatus>,
    token: CancellationToken,
}

/// Handle used by the engine to update one instance.
#[derive(Clone)]
pub struct StatusHandle {
    instance: Arc<TrackedInstance>,
    bus: Arc<dyn MessageBus>,
}

impl fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusHandle")
            .field("cancelled", &self.instance.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StatusHandle {
    /// The run's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.instance.token
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> WorkflowStatus {
        self.instance.status.lock().await.clone()
    }

    /// Applies `update` to the status and publishes the result.
    pub async fn update<F>(&self, update: F) -> WorkflowStatus
    where
        F: FnOnce(&mut WorkflowStatus),
    {
        let snapshot = {
            let mut status = self.instance.status.lock().await;
            update(&mut status);
            status.updated_at = Utc::now();
            status.recompute_progress();
            status.clone()
        };
        self.publish(&snapshot).await;
        snapshot
    }

    /// Moves a step to `next`, applying `update` to its status.
    ///
    /// Returns false, leaving the status untouched, when the transition is
    /// not allowed. Entering `Running` is refused once cancellation has been
    /// requested or the run's token has fired; the check happens under the
    /// instance lock, the same lock cancellation is recorded under.
    pub async fn transition_step<F>(&self, step_id: &str, next: StepState, update: F) -> bool
    where
        F: FnOnce(&mut StepStatus),
    {
        let snapshot = {
            let mut status = self.instance.status.lock().await;
            if next == StepState::Running
                && (status.cancel_requested_at.is_some() || self.instance.token.is_cancelled())
            {
                debug!(step_id = %step_id, "Refusing to start step after cancellation");
                return false;
            }
            let Some(step) = status.step_mut(step_id) else {
                warn!(step_id = %step_id, "Transition for unknown step");
                return false;
            };
            if !step.state.can_transition_to(next) {
                warn!(
                    step_id = %step_id,
                    from = %step.state,
                    to = %next,
                    "Rejected step state transition"
                );
                return false;
            }
            step.state = next;
            let now = Utc::now();
            if next == StepState::Running {
                step.started_at.get_or_insert(now);
            }
            if next.is_settled() {
                step.completed_at = Some(now);
            }
            update(step);
            if next == StepState::Running {
                status.current_step = Some(step_id.to_string());
            }
            status.updated_at = now;
            status.recompute_progress();
            status.clone()
        };
        self.publish(&snapshot).await;
        true
    }

    /// Re-opens a settled step for a feedback iteration.
    ///
    /// The step goes back to `Waiting` with its iteration counter bumped and
    /// its attempt counter reset.
    pub async fn reenter_step(&self, step_id: &str) -> bool {
        let snapshot = {
            let mut status = self.instance.status.lock().await;
            let Some(step) = status.step_mut(step_id) else {
                return false;
            };
            step.state = StepState::Waiting;
            step.iteration += 1;
            step.attempt = 0;
            step.completed_at = None;
            step.message = Some(format!("feedback iteration {}", step.iteration));
            status.updated_at = Utc::now();
            status.recompute_progress();
            status.clone()
        };
        self.publish(&snapshot).await;
        true
    }

    async fn publish(&self, snapshot: &WorkflowStatus) {
        let payload = serde_json::to_value(snapshot).unwrap_or_default();
        publish_logged(self.bus.as_ref(), BusMessage::new(topics::WORKFLOW_STATUS_UPDATED, payload))
            .await;
    }
}

/// Retention limits for terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// How long a terminal status is kept.
    pub max_age: Duration,
    /// Maximum number of terminal statuses kept.
    pub max_entries: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age: Duration::from_secs(3600), max_entries: 1000 }
    }
}

/// Registry of per-instance statuses.
pub struct StatusTracker {
    instances: RwLock<HashMap<String, Arc<TrackedInstance>>>,
    bus: Arc<dyn MessageBus>,
    retention: std::sync::RwLock<RetentionPolicy>,
}

impl fmt::Debug for StatusTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTracker")
            .field("instances", &self.instances.try_read().map(|i| i.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl StatusTracker {
    /// Creates an empty tracker publishing to `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, retention: RetentionPolicy) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            bus,
            retention: std::sync::RwLock::new(retention),
        }
    }

    /// Replaces the retention policy.
    pub fn set_retention(&self, retention: RetentionPolicy) {
        if let Ok(mut current) = self.retention.write() {
            *current = retention;
        }
    }

    /// Registers a new instance.
    ///
    /// `token` is the run's cancellation token; nested runs pass a child of
    /// their parent's token.
    ///
    /// # Errors
    /// Returns `TrackerError::InstanceActive` if a non-terminal instance with
    /// the same id exists. A terminal one is replaced.
    pub async fn register(
        &self,
        status: WorkflowStatus,
        token: CancellationToken,
    ) -> Result<StatusHandle, TrackerError> {
        let instance_id = status.instance_id.clone();
        let mut instances = self.instances.write().await;
        if let Some(existing) = instances.get(&instance_id) {
            if !existing.status.lock().await.state.is_terminal() {
                return Err(TrackerError::InstanceActive(instance_id));
            }
        }
        let instance = Arc::new(TrackedInstance { status: Mutex::new(status), token });
        instances.insert(instance_id, Arc::clone(&instance));
        Ok(StatusHandle { instance, bus: Arc::clone(&self.bus) })
    }

    /// Snapshot of an instance's status.
    pub async fn get(&self, instance_id: &str) -> Option<WorkflowStatus> {
        let instance = self.instances.read().await.get(instance_id).cloned()?;
        let snapshot = instance.status.lock().await.clone();
        Some(snapshot)
    }

    /// Snapshots of every tracked instance.
    pub async fn list(&self) -> Vec<WorkflowStatus> {
        let instances: Vec<_> = self.instances.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(instances.len());
        for instance in instances {
            statuses.push(instance.status.lock().await.clone());
        }
        statuses
    }

    /// Number of tracked instances.
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Returns true if nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Requests cancellation of a running instance.
    ///
    /// The request time is recorded and the token cancelled while the
    /// instance lock is held, so no step can enter `Running` afterwards.
    pub async fn cancel(&self, instance_id: &str) -> CancelOutcome {
        let Some(instance) = self.instances.read().await.get(instance_id).cloned() else {
            return CancelOutcome::NotFound;
        };

        let snapshot = {
            let mut status = instance.status.lock().await;
            if status.state.is_terminal() {
                return CancelOutcome::AlreadyTerminal;
            }
            if status.cancel_requested_at.is_none() {
                status.cancel_requested_at = Some(Utc::now());
                status.updated_at = Utc::now();
            }
            instance.token.cancel();
            status.clone()
        };

        debug!(instance_id = %instance_id, "Cancellation requested");
        let payload = serde_json::to_value(&snapshot).unwrap_or_default();
        publish_logged(self.bus.as_ref(), BusMessage::new(topics::WORKFLOW_STATUS_UPDATED, payload))
            .await;
        CancelOutcome::Signalled
    }

    /// Drops terminal statuses that are too old, then the oldest terminal
    /// ones beyond the entry cap. Running instances are never dropped.
    ///
    /// Returns the ids that were removed.
    pub async fn purge_expired(&self) -> Vec<String> {
        let policy = self.retention.read().map(|p| *p).unwrap_or_default();
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(policy.max_age).unwrap_or(chrono::Duration::MAX);

        let mut instances = self.instances.write().await;
        let mut terminal: Vec<(String, DateTime<Utc>)> = Vec::new();
        for (id, instance) in instances.iter() {
            let status = instance.status.lock().await;
            if status.state.is_terminal() {
                terminal.push((id.clone(), status.completed_at.unwrap_or(status.updated_at)));
            }
        }

        terminal.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let mut removed = Vec::new();
        let mut remaining = terminal.len();
        for (id, completed_at) in terminal {
            let expired = now.signed_duration_since(completed_at) > max_age;
            if expired || remaining > policy.max_entries {
                instances.remove(&id);
                removed.push(id);
                remaining -= 1;
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "Purged retained workflow statuses");
        }
        removed
    }
}
