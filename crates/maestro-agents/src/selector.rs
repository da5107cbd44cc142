//! Task selector for picking the best agent for a piece of free-text work.
//!
//! Selection is filter, then score, then pick. Scoring is a tunable
//! heuristic behind [`ScoringStrategy`]; the default [`WeightedScoring`]
//! rewards historical performance and matching skills and penalises load.

use crate::bus::{BusMessage, MessageBus, publish_logged, topics};
use crate::error::{AgentError, Result};
use crate::metrics::MetricsRecorder;
use crate::registry::AgentRegistry;
use crate::safety::SafetyValidator;
use crate::{Agent, AgentCapabilities, AgentType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Optional constraints on which agents may take a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirements {
    /// Agent family the task needs.
    pub agent_type: Option<AgentType>,
    /// Actions the agent must support.
    pub required_capabilities: HashSet<String>,
    /// Minimum average skill level.
    pub minimum_skill_level: Option<f64>,
    /// Maximum acceptable load factor.
    pub max_load_factor: Option<f64>,
}

impl TaskRequirements {
    /// Requirements matching only on agent type.
    #[must_use]
    pub fn for_type(agent_type: AgentType) -> Self {
        Self { agent_type: Some(agent_type), ..Self::default() }
    }

    /// Returns true if `agent_type` and `capabilities` pass every filter.
    #[must_use]
    pub fn accepts(&self, agent_type: &AgentType, capabilities: &AgentCapabilities) -> bool {
        if self.agent_type.as_ref().is_some_and(|wanted| wanted != agent_type) {
            return false;
        }
        if !capabilities.supports_all(&self.required_capabilities) {
            return false;
        }
        if self.minimum_skill_level.is_some_and(|min| capabilities.average_skill() < min) {
            return false;
        }
        if self.max_load_factor.is_some_and(|max| capabilities.load_factor > max) {
            return false;
        }
        true
    }
}

/// Assigns a desirability score to an agent for a task.
pub trait ScoringStrategy: Send + Sync {
    /// Higher is better.
    fn score(&self, description: &str, capabilities: &AgentCapabilities) -> f64;
}

/// `performance_weight·performance − load_weight·load + Σ skill_weight·skill[d]`
/// over every skill domain `d` that occurs in the description
/// (case-insensitive substring match).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedScoring {
    /// Weight of historical performance.
    pub performance_weight: f64,
    /// Penalty per unit of load.
    pub load_weight: f64,
    /// Weight of each matching skill.
    pub skill_weight: f64,
}

impl Default for WeightedScoring {
    fn default() -> Self {
        Self { performance_weight: 3.0, load_weight: 2.0, skill_weight: 5.0 }
    }
}

impl ScoringStrategy for WeightedScoring {
    fn score(&self, description: &str, capabilities: &AgentCapabilities) -> f64 {
        let text = description.to_lowercase();
        let skill_match: f64 = capabilities
            .skill_levels
            .iter()
            .filter(|(domain, _)| text.contains(&domain.to_lowercase()))
            .map(|(_, level)| level * self.skill_weight)
            .sum();

        self.performance_weight * capabilities.historical_performance
            - self.load_weight * capabilities.load_factor
            + skill_match
    }
}

/// A candidate agent together with its score.
#[derive(Clone)]
pub struct ScoredAgent {
    /// The candidate.
    pub agent: Arc<dyn Agent>,
    /// Its score for the task.
    pub score: f64,
}

impl fmt::Debug for ScoredAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoredAgent")
            .field("agent_id", &self.agent.id())
            .field("score", &self.score)
            .finish()
    }
}

/// Filters `agents` by `requirements`, scores the survivors and returns
/// them best first.
///
/// Equal scores are ordered by ascending agent id, so the outcome never
/// depends on registry iteration order.
pub fn rank_candidates(
    agents: &[Arc<dyn Agent>],
    description: &str,
    requirements: &TaskRequirements,
    strategy: &dyn ScoringStrategy,
) -> Vec<ScoredAgent> {
    let mut ranked: Vec<ScoredAgent> = agents
        .iter()
        .filter_map(|agent| {
            let capabilities = agent.capabilities();
            if !requirements.accepts(&agent.agent_type(), &capabilities) {
                return None;
            }
            let score = strategy.score(description, &capabilities);
            Some(ScoredAgent { agent: Arc::clone(agent), score })
        })
        .collect();

    ranked.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.agent.id().cmp(b.agent.id()),
        other => other,
    });
    ranked
}

/// Picks an agent for free-text tasks.
pub struct TaskSelector {
    registry: Arc<AgentRegistry>,
    validator: Arc<dyn SafetyValidator>,
    scoring: Arc<dyn ScoringStrategy>,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for TaskSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSelector").field("registry", &self.registry).finish_non_exhaustive()
    }
}

impl TaskSelector {
    /// Creates a new task selector.
    ///
    /// # Arguments
    /// * `registry` - Where candidates come from
    /// * `validator` - Safety check applied to every task
    /// * `scoring` - Ranking heuristic
    /// * `bus` - Where `task.assigned` is published
    /// * `metrics` - Assignment counters
    pub fn new(
        registry: Arc<AgentRegistry>,
        validator: Arc<dyn SafetyValidator>,
        scoring: Arc<dyn ScoringStrategy>,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self { registry, validator, scoring, bus, metrics }
    }

    /// The scoring strategy in use.
    pub fn scoring(&self) -> Arc<dyn ScoringStrategy> {
        Arc::clone(&self.scoring)
    }

    /// Selects the best agent for `description`.
    ///
    /// # Arguments
    /// * `description` - Free-text task
    /// * `requirements` - Optional constraints on the candidates
    ///
    /// # Errors
    /// * `AgentError::UnsafeTask` if the safety validator rejects the text
    /// * `AgentError::NoSuitableAgent` if no registered agent passes the filters
    pub async fn assign(
        &self,
        description: &str,
        requirements: Option<&TaskRequirements>,
    ) -> Result<Arc<dyn Agent>> {
        let verdict = self.validator.validate(description).await;
        if !verdict.is_valid {
            warn!(reason = %verdict.message, "Task rejected by safety validator");
            self.metrics.increment("tasks.rejected", 1);
            return Err(AgentError::UnsafeTask(verdict.message));
        }

        let default_requirements = TaskRequirements::default();
        let requirements = requirements.unwrap_or(&default_requirements);

        let agents = self.registry.list().await;
        let ranked = rank_candidates(&agents, description, requirements, self.scoring.as_ref());
        debug!(candidates = ranked.len(), registered = agents.len(), "Scored task candidates");

        let Some(best) = ranked.into_iter().next() else {
            self.metrics.increment("tasks.rejected", 1);
            return Err(AgentError::NoSuitableAgent(format!(
                "none of {} registered agents match the requirements",
                agents.len()
            )));
        };

        info!(agent_id = %best.agent.id(), score = best.score, "Task assigned");
        self.metrics.increment("tasks.assigned", 1);
        publish_logged(
            self.bus.as_ref(),
            BusMessage::new(
                topics::TASK_ASSIGNED,
                serde_json::json!({
                    "task": description,
                    "agent_id": best.agent.id(),
                    "score": best.score,
                    "timestamp": Utc::now(),
                }),
            ),
        )
        .await;

        Ok(best.agent)
    }
}
