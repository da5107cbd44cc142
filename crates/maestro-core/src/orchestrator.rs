//! Orchestrator facade.
//!
//! [`Orchestrator`] is the single entry point hosts talk to. It owns the
//! agent registry, the task selector and the execution engine, validates
//! definitions before they run, enforces the concurrent workflow limit and
//! keeps a cache of the latest status of every instance it has seen.
//!
//! # Example
//!
//! ```rust,no_run
//! use maestro_agents::{AgentType, ScriptedAgent};
//! use maestro_core::{Orchestrator, WorkflowDefinition, WorkflowStep, WorkflowType};
//! use std::sync::Arc;
//!
//! # async fn example() -> maestro_core::Result<()> {
//! let orchestrator = Orchestrator::builder().build()?;
//! orchestrator
//!     .register_agent(Arc::new(ScriptedAgent::new("a1", AgentType::Reactive)))
//!     .await?;
//!
//! let definition = WorkflowDefinition::new("wf", "Demo", WorkflowType::Sequential)
//!     .with_step(WorkflowStep::new("s1", "Say hello"));
//! let result = orchestrator.execute_workflow(&definition, None).await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics::MetricsGate;
use crate::models::{
    ErrorCode, ErrorSeverity, WorkflowContext, WorkflowDefinition, WorkflowError, WorkflowResult,
    WorkflowStatus,
};
use crate::workflow::{CancelOutcome, ExecutionEngine, PreparedRun, ValidationOptions, validate_with};
use maestro_agents::{
    Agent, AgentInfo, AgentRegistry, AllowAllValidator, BroadcastBus, BusMessage, MessageBus,
    MetricsRecorder, NoopBus, NoopMetrics, SafetyValidator, ScoringStrategy, TaskRequirements,
    TaskSelector, WeightedScoring,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Holds one slot of the concurrent workflow limit until dropped.
struct AdmissionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    bus: Option<Arc<dyn MessageBus>>,
    broadcast: Option<Arc<BroadcastBus>>,
    validator: Arc<dyn SafetyValidator>,
    metrics: Arc<dyn MetricsRecorder>,
    scoring: Arc<dyn ScoringStrategy>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder").field("config", &self.config).finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            bus: None,
            broadcast: None,
            validator: Arc::new(AllowAllValidator),
            metrics: Arc::new(NoopMetrics),
            scoring: Arc::new(WeightedScoring::default()),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Publishes events on `bus`.
    #[must_use]
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self.broadcast = None;
        self
    }

    /// Publishes events on an in-process broadcast bus that
    /// [`Orchestrator::subscribe`] can listen to.
    #[must_use]
    pub fn broadcast_bus(mut self, bus: Arc<BroadcastBus>) -> Self {
        let shared: Arc<dyn MessageBus> = bus.clone();
        self.bus = Some(shared);
        self.broadcast = Some(bus);
        self
    }

    /// Sets the safety validator applied to assigned tasks.
    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn SafetyValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the metrics recorder.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the agent scoring strategy.
    #[must_use]
    pub fn scoring(mut self, scoring: Arc<dyn ScoringStrategy>) -> Self {
        self.scoring = scoring;
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Config` if the configuration is invalid.
    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;

        let bus = self.bus.unwrap_or_else(|| Arc::new(NoopBus));
        let metrics = MetricsGate::new(self.metrics, self.config.enable_metrics);
        let recorder: Arc<dyn MetricsRecorder> = Arc::new(metrics.clone());

        let registry = Arc::new(AgentRegistry::with_collaborators(Arc::clone(&bus), Arc::clone(&recorder)));
        let selector = Arc::new(TaskSelector::new(
            Arc::clone(&registry),
            self.validator,
            Arc::clone(&self.scoring),
            Arc::clone(&bus),
            recorder,
        ));
        let engine = ExecutionEngine::new(
            Arc::clone(&registry),
            bus,
            self.scoring,
            metrics.clone(),
            self.config.engine_config(),
        );

        Ok(Orchestrator {
            registry,
            selector,
            engine,
            config: Arc::new(RwLock::new(self.config)),
            cache: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            metrics,
            broadcast: self.broadcast,
        })
    }
}

/// Facade over the agent registry, task selector and execution engine.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    selector: Arc<TaskSelector>,
    engine: ExecutionEngine,
    config: Arc<RwLock<OrchestratorConfig>>,
    /// Latest known status per instance.
    cache: Arc<RwLock<HashMap<String, WorkflowStatus>>>,
    /// Workflows currently executing.
    active: Arc<AtomicUsize>,
    metrics: MetricsGate,
    broadcast: Option<Arc<BroadcastBus>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("active_workflows", &self.active.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The execution engine.
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Current configuration.
    pub async fn config(&self) -> OrchestratorConfig {
        self.config.read().await.clone()
    }

    /// Receiver for bus events, when built with a broadcast bus.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<BusMessage>> {
        self.broadcast.as_ref().map(|bus| bus.subscribe())
    }

    /// Number of workflows currently executing.
    pub fn active_workflows(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Registers an agent.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Agent` if the id is already registered.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        self.registry.register(agent).await?;
        Ok(())
    }

    /// Removes an agent. Returns false if it was not registered.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        self.registry.unregister(agent_id).await
    }

    /// Snapshots of every registered agent, ordered by id.
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        self.registry.list_info().await
    }

    /// Picks the best registered agent for a free-text task.
    ///
    /// # Errors
    /// * `OrchestratorError::Agent(AgentError::UnsafeTask)` if the safety
    ///   validator rejects the text
    /// * `OrchestratorError::Agent(AgentError::NoSuitableAgent)` if nothing matches
    pub async fn assign_task(
        &self,
        description: &str,
        requirements: Option<&TaskRequirements>,
    ) -> Result<Arc<dyn Agent>> {
        Ok(self.selector.assign(description, requirements).await?)
    }

    /// Validates and executes `definition` to completion.
    ///
    /// Never fails: validation problems, capacity rejection and execution
    /// failures all come back as a failed [`WorkflowResult`].
    #[instrument(skip_all, fields(workflow_id = %definition.id))]
    pub async fn execute_workflow(
        &self,
        definition: &WorkflowDefinition,
        context: Option<WorkflowContext>,
    ) -> WorkflowResult {
        match self.prepare(definition, context.unwrap_or_default()).await {
            Ok((prepared, guard)) => {
                let result = self.engine.drive(prepared).await;
                drop(guard);
                self.remember(&result).await;
                result
            }
            Err(result) => result,
        }
    }

    /// Validates `definition` and starts executing it in the background.
    ///
    /// The status is visible through [`Orchestrator::get_workflow_status`]
    /// as soon as this returns. Rejections resolve the handle immediately
    /// with a failed result.
    pub async fn start_workflow(
        &self,
        definition: &WorkflowDefinition,
        context: Option<WorkflowContext>,
    ) -> (String, JoinHandle<WorkflowResult>) {
        let context = context.unwrap_or_default();
        let instance_id = context.instance_id.clone();

        let handle = match self.prepare(definition, context).await {
            Ok((prepared, guard)) => {
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    let result = orchestrator.engine.drive(prepared).await;
                    drop(guard);
                    orchestrator.remember(&result).await;
                    result
                })
            }
            Err(result) => tokio::spawn(async move { result }),
        };
        (instance_id, handle)
    }

    /// Latest status of an instance.
    pub async fn get_workflow_status(&self, instance_id: &str) -> Option<WorkflowStatus> {
        if let Some(status) = self.cache.read().await.get(instance_id) {
            if status.state.is_terminal() {
                return Some(status.clone());
            }
        }

        let mut cache = self.cache.write().await;
        match self.engine.status(instance_id).await {
            Some(status) => {
                cache.insert(instance_id.to_string(), status.clone());
                Some(status)
            }
            None => {
                cache.remove(instance_id);
                None
            }
        }
    }

    /// Requests cancellation of a running instance.
    ///
    /// Returns `Ok(true)` if the instance was signalled and `Ok(false)` if
    /// it had already finished.
    ///
    /// # Errors
    /// Returns `OrchestratorError::WorkflowNotFound` for unknown ids.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, instance_id: &str) -> Result<bool> {
        match self.engine.cancel(instance_id).await {
            CancelOutcome::Signalled => {
                info!("Workflow cancellation requested");
                Ok(true)
            }
            CancelOutcome::AlreadyTerminal => {
                debug!("Cancel ignored, workflow already finished");
                Ok(false)
            }
            CancelOutcome::NotFound => {
                if self.cache.read().await.contains_key(instance_id) {
                    Ok(false)
                } else {
                    Err(OrchestratorError::WorkflowNotFound(instance_id.to_string()))
                }
            }
        }
    }

    /// Replaces the configuration.
    ///
    /// Limits apply to workflows admitted afterwards; engine settings apply
    /// to runs started afterwards.
    ///
    /// # Errors
    /// Returns `OrchestratorError::Config` if the configuration is invalid;
    /// the previous configuration stays in place.
    pub async fn configure(&self, config: OrchestratorConfig) -> Result<()> {
        config.validate()?;
        self.engine.set_config(config.engine_config()).await;
        self.metrics.set_enabled(config.enable_metrics);
        info!(
            max_concurrent_workflows = config.max_concurrent_workflows,
            default_error_handling = ?config.default_error_handling,
            metrics = config.enable_metrics,
            "Orchestrator reconfigured"
        );
        *self.config.write().await = config;
        Ok(())
    }

    /// Drops expired terminal statuses from the engine and the cache.
    pub async fn purge_expired(&self) -> Vec<String> {
        let removed = self.engine.purge_expired().await;
        self.sync_cache().await;
        removed
    }

    async fn prepare(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> std::result::Result<(PreparedRun, AdmissionGuard), WorkflowResult> {
        let config = self.config().await;
        let instance_id = context.instance_id.clone();

        if config.validate_workflows {
            let problems = validate_with(
                definition,
                ValidationOptions { check_steps: config.validate_steps },
            );
            if !problems.is_empty() {
                warn!(problems = problems.len(), "Workflow failed validation");
                self.metrics.increment("workflows.failed", 1);
                let errors = problems
                    .iter()
                    .map(|p| WorkflowError::new(ErrorCode::ValidationFailed, p.to_string(), ErrorSeverity::Error))
                    .collect();
                return Err(WorkflowResult::rejected(instance_id, &definition.id, errors));
            }
        }

        let Some(guard) = self.admit(config.max_concurrent_workflows) else {
            warn!(limit = config.max_concurrent_workflows, "Workflow rejected, at capacity");
            self.metrics.increment("workflows.failed", 1);
            let error = WorkflowError::new(
                ErrorCode::CapacityExceeded,
                format!("{} workflows already running", config.max_concurrent_workflows),
                ErrorSeverity::Critical,
            );
            return Err(WorkflowResult::rejected(instance_id, &definition.id, vec![error]));
        };

        match self.engine.begin(definition, context).await {
            Ok(prepared) => {
                // A reused id must not keep reporting the previous run's status.
                self.cache.write().await.remove(prepared.instance_id());
                Ok((prepared, guard))
            }
            Err(e) => Err(self.engine.refuse(instance_id, &definition.id, &e)),
        }
    }

    fn admit(&self, limit: usize) -> Option<AdmissionGuard> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| (active < limit).then_some(active + 1))
            .ok()
            .map(|_| AdmissionGuard { active: Arc::clone(&self.active) })
    }

    async fn remember(&self, result: &WorkflowResult) {
        if let Some(status) = self.engine.status(&result.instance_id).await {
            self.cache.write().await.insert(result.instance_id.clone(), status);
        }
        self.sync_cache().await;
    }

    /// Keeps the cache in step with the engine's retention.
    async fn sync_cache(&self) {
        let live: HashSet<String> =
            self.engine.tracker().list().await.into_iter().map(|s| s.instance_id).collect();
        self.cache.write().await.retain(|id, _| live.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WorkflowStep, WorkflowType};
    use maestro_agents::{AgentError, AgentType, ScriptedAgent};

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = OrchestratorConfig::default();
        config.max_concurrent_workflows = 0;
        let err = Orchestrator::builder().config(config).build().unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn test_duplicate_agent_surfaces_agent_error() {
        let orchestrator = Orchestrator::builder().build().unwrap();
        let agent = Arc::new(ScriptedAgent::new("a1", AgentType::Reactive));
        orchestrator.register_agent(agent.clone()).await.unwrap();

        let err = orchestrator.register_agent(agent).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Agent(AgentError::DuplicateAgent(id)) if id == "a1"));
        assert_eq!(orchestrator.list_agents().await.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_is_a_failed_result() {
        let orchestrator = Orchestrator::builder().build().unwrap();
        let def = WorkflowDefinition::new("wf", "", WorkflowType::Sequential);

        let result = orchestrator.execute_workflow(&def, None).await;
        assert!(!result.success);
        assert_eq!(result.errors_with_code(ErrorCode::ValidationFailed).count(), 2);
        assert_eq!(orchestrator.active_workflows(), 0);
    }

    #[tokio::test]
    async fn test_status_of_unknown_instance() {
        let orchestrator = Orchestrator::builder().build().unwrap();
        assert!(orchestrator.get_workflow_status("missing").await.is_none());
        assert!(matches!(
            orchestrator.cancel_workflow("missing").await,
            Err(OrchestratorError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_validates_and_applies() {
        let orchestrator = Orchestrator::builder().build().unwrap();

        let mut bad = OrchestratorConfig::default();
        bad.default_step_timeout_secs = 0;
        assert!(orchestrator.configure(bad).await.is_err());
        assert_eq!(orchestrator.config().await.default_step_timeout_secs, 300);

        let mut good = OrchestratorConfig::default();
        good.default_step_timeout_secs = 5;
        good.engine.max_concurrent_steps = 2;
        orchestrator.configure(good).await.unwrap();

        let engine = orchestrator.engine().config().await;
        assert_eq!(engine.default_step_timeout_secs, 5);
        assert_eq!(engine.max_concurrent_steps, 2);
    }

    #[tokio::test]
    async fn test_completed_status_is_cached() {
        let orchestrator = Orchestrator::builder().build().unwrap();
        orchestrator
            .register_agent(Arc::new(ScriptedAgent::new("a1", AgentType::Reactive)))
            .await
            .unwrap();
        let def = WorkflowDefinition::new("wf", "Demo", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("s1", "Step"));

        let context = WorkflowContext::new().with_instance_id("cached");
        let result = orchestrator.execute_workflow(&def, Some(context)).await;
        assert!(result.success);

        let status = orchestrator.get_workflow_status("cached").await.unwrap();
        assert!(status.state.is_terminal());
        assert!(!orchestrator.cancel_workflow("cached").await.unwrap());
    }
}
