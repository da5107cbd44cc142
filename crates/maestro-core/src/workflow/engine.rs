//! Core workflow execution engine.
//!
//! The engine turns a [`WorkflowDefinition`] plus a [`WorkflowContext`] into
//! a [`WorkflowResult`]. Each run is registered with the [`StatusTracker`],
//! scheduled by the scheduler for its workflow type, raced against the
//! workflow deadline and its cancellation token, and finally aggregated in
//! step declaration order.
//!
//! Nothing that goes wrong during a run escapes as an error: failures,
//! timeouts, cancellation and even panics end up as structured
//! [`WorkflowError`]s on a failed result.

use crate::config::EngineConfig;
use crate::metrics::MetricsGate;
use crate::models::{
    ErrorCode, ErrorSeverity, StepState, WorkflowContext, WorkflowDefinition, WorkflowError,
    WorkflowResult, WorkflowState, WorkflowStatus,
};
use crate::workflow::dag::{DagError, DependencyGraph};
use crate::workflow::run::Run;
use crate::workflow::scheduler;
use crate::workflow::step::{settle_interrupted, settle_stranded};
use crate::workflow::tracker::{CancelOutcome, RetentionPolicy, StatusTracker, TrackerError};
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use maestro_agents::{AgentRegistry, MessageBus, MetricsRecorder, ScoringStrategy};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Errors that prevent a run from being set up.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The step graph is unusable.
    #[error(transparent)]
    Graph(#[from] DagError),

    /// The instance id is already in use.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// A registered run that has not started yet.
///
/// Its status is already visible through [`ExecutionEngine::status`], so
/// callers can hand out the instance id before driving it.
pub struct PreparedRun {
    run: Arc<Run>,
}

impl PreparedRun {
    /// Instance id of the run.
    pub fn instance_id(&self) -> &str {
        &self.run.context.instance_id
    }

    /// Id of the definition being run.
    pub fn workflow_id(&self) -> &str {
        &self.run.definition.id
    }
}

impl fmt::Debug for PreparedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRun")
            .field("instance_id", &self.instance_id())
            .field("workflow_id", &self.workflow_id())
            .finish()
    }
}

enum Stop {
    Finished,
    Deadline,
    Cancelled,
}

/// Executes workflow definitions against the agent registry.
#[derive(Clone)]
pub struct ExecutionEngine {
    registry: Arc<AgentRegistry>,
    tracker: Arc<StatusTracker>,
    config: Arc<RwLock<EngineConfig>>,
    scoring: Arc<dyn ScoringStrategy>,
    metrics: MetricsGate,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

fn retention(config: &EngineConfig) -> RetentionPolicy {
    RetentionPolicy {
        max_age: config.status_retention(),
        max_entries: config.max_retained_statuses,
    }
}

impl ExecutionEngine {
    /// Creates a new execution engine.
    ///
    /// # Arguments
    /// * `registry` - Where step agents are resolved
    /// * `bus` - Where status updates are published
    /// * `scoring` - Ranking used to pick step agents
    /// * `metrics` - Run and step counters
    /// * `config` - Engine settings
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<dyn MessageBus>,
        scoring: Arc<dyn ScoringStrategy>,
        metrics: MetricsGate,
        config: EngineConfig,
    ) -> Self {
        let tracker = Arc::new(StatusTracker::new(bus, retention(&config)));
        Self { registry, tracker, config: Arc::new(RwLock::new(config)), scoring, metrics }
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The status tracker.
    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    /// The scoring strategy used for step agents.
    pub fn scoring(&self) -> &Arc<dyn ScoringStrategy> {
        &self.scoring
    }

    /// The metrics recorder.
    pub fn metrics(&self) -> &MetricsGate {
        &self.metrics
    }

    /// Current settings.
    pub async fn config(&self) -> EngineConfig {
        self.config.read().await.clone()
    }

    /// Replaces the settings. Runs already in flight keep the settings they
    /// started with.
    pub async fn set_config(&self, config: EngineConfig) {
        self.tracker.set_retention(retention(&config));
        *self.config.write().await = config;
    }

    /// Executes `definition` to completion.
    ///
    /// The definition is expected to be validated; a graph the engine cannot
    /// schedule yields a failed result without running anything.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> WorkflowResult {
        let instance_id = context.instance_id.clone();
        match self.begin(definition, context).await {
            Ok(prepared) => self.drive(prepared).await,
            Err(e) => self.refuse(instance_id, &definition.id, &e),
        }
    }

    /// Registers a run without starting it.
    ///
    /// # Errors
    /// * `EngineError::Graph` if the dependency graph has a cycle or a
    ///   dangling reference
    /// * `EngineError::Tracker` if the instance id belongs to a running instance
    pub async fn begin(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> Result<PreparedRun, EngineError> {
        self.begin_with_token(definition.clone(), context, CancellationToken::new()).await
    }

    async fn begin_with_token(
        &self,
        definition: WorkflowDefinition,
        context: WorkflowContext,
        token: CancellationToken,
    ) -> Result<PreparedRun, EngineError> {
        let graph = DependencyGraph::from_definition(&definition)?;
        let config = self.config().await;
        let status = WorkflowStatus::new(
            context.instance_id.clone(),
            definition.id.clone(),
            definition.name.clone(),
            definition.steps.iter().map(|s| s.id.clone()),
        );
        let handle = self.tracker.register(status, token).await?;
        let run = Run::new(self.clone(), definition, context, handle, config, &graph);
        Ok(PreparedRun { run: Arc::new(run) })
    }

    /// Runs a prepared run to completion.
    ///
    /// The run executes on its own task; if that task panics the result is
    /// a failed one carrying an `INTERNAL_ERROR`.
    pub async fn drive(&self, prepared: PreparedRun) -> WorkflowResult {
        let run = prepared.run;
        let started = Instant::now();
        let task = tokio::spawn(self.clone().run_to_completion(Arc::clone(&run), started));

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    instance_id = %run.context.instance_id,
                    error = %e,
                    "Workflow task failed"
                );
                let internal = WorkflowError::new(
                    ErrorCode::InternalError,
                    format!("workflow task failed: {e}"),
                    ErrorSeverity::Critical,
                );
                self.finish(&run, started, Some(internal)).await
            }
        }
    }

    /// Executes a nested definition that stops when `token` is cancelled.
    pub(crate) fn run_nested(
        &self,
        definition: WorkflowDefinition,
        context: WorkflowContext,
        token: CancellationToken,
    ) -> BoxFuture<'static, WorkflowResult> {
        let engine = self.clone();
        async move {
            let instance_id = context.instance_id.clone();
            let workflow_id = definition.id.clone();
            match engine.begin_with_token(definition, context, token).await {
                Ok(prepared) => engine.drive(prepared).await,
                Err(e) => engine.refuse(instance_id, &workflow_id, &e),
            }
        }
        .boxed()
    }

    /// Latest status of an instance.
    pub async fn status(&self, instance_id: &str) -> Option<WorkflowStatus> {
        self.tracker.get(instance_id).await
    }

    /// Requests cancellation of an instance.
    pub async fn cancel(&self, instance_id: &str) -> CancelOutcome {
        self.tracker.cancel(instance_id).await
    }

    /// Drops expired terminal statuses and returns their ids.
    pub async fn purge_expired(&self) -> Vec<String> {
        self.tracker.purge_expired().await
    }

    /// Failed result for a run that could not be set up.
    pub(crate) fn refuse(
        &self,
        instance_id: String,
        workflow_id: &str,
        e: &EngineError,
    ) -> WorkflowResult {
        let code = match e {
            EngineError::Graph(_) => ErrorCode::ValidationFailed,
            EngineError::Tracker(_) => ErrorCode::InternalError,
        };
        warn!(instance_id = %instance_id, workflow_id = %workflow_id, error = %e, "Workflow refused");
        self.metrics.increment("workflows.failed", 1);
        WorkflowResult::rejected(
            instance_id,
            workflow_id,
            vec![WorkflowError::new(code, e.to_string(), ErrorSeverity::Critical)],
        )
    }

    #[instrument(
        skip_all,
        fields(workflow_id = %run.definition.id, instance_id = %run.context.instance_id)
    )]
    async fn run_to_completion(self, run: Arc<Run>, started: Instant) -> WorkflowResult {
        run.handle
            .update(|s| {
                s.state = WorkflowState::Running;
                s.started_at = Some(Utc::now());
            })
            .await;
        self.metrics.increment("workflows.started", 1);
        info!(
            workflow_type = %run.definition.workflow_type,
            steps = run.definition.steps.len(),
            mode = ?run.mode,
            "Workflow started"
        );

        let timeout =
            run.definition.timeout.unwrap_or_else(|| run.config.default_workflow_timeout());
        let deadline = tokio::time::Instant::now() + timeout;
        let token = run.handle.token().clone();
        let mut scheduler = Box::pin(scheduler::schedule(Arc::clone(&run)));

        let stop = tokio::select! {
            () = &mut scheduler => Stop::Finished,
            () = tokio::time::sleep_until(deadline) => Stop::Deadline,
            () = token.cancelled() => Stop::Cancelled,
        };

        match stop {
            Stop::Finished => {}
            Stop::Deadline | Stop::Cancelled => {
                if matches!(stop, Stop::Deadline) {
                    warn!(timeout_ms = timeout.as_millis(), "Workflow deadline reached");
                    run.mark_deadline_hit();
                    run.record_error(WorkflowError::new(
                        ErrorCode::WorkflowTimeout,
                        format!("workflow exceeded {}ms", timeout.as_millis()),
                        ErrorSeverity::Critical,
                    ))
                    .await;
                } else {
                    info!("Workflow cancellation received");
                }
                token.cancel();

                let grace = run.config.cancellation_grace();
                if tokio::time::timeout(grace, &mut scheduler).await.is_err() {
                    warn!(grace_ms = grace.as_millis(), "Steps still running after grace period; aborting");
                }
                drop(scheduler);
            }
        }

        self.finish(&run, started, None).await
    }

    /// Settles leftover steps, decides the final state and builds the result.
    async fn finish(
        &self,
        run: &Arc<Run>,
        started: Instant,
        internal: Option<WorkflowError>,
    ) -> WorkflowResult {
        if let Some(internal) = internal {
            run.record_error(internal).await;
            run.halt();
        }

        let interrupted = run.deadline_hit() || run.handle.token().is_cancelled();
        let snapshot = run.handle.snapshot().await;
        for status in &snapshot.steps {
            match status.state {
                StepState::NotStarted => {
                    let reason = if run.fallbacks.contains(&status.step_id) {
                        "fallback not used"
                    } else {
                        "not started"
                    };
                    run.handle
                        .transition_step(&status.step_id, StepState::Skipped, |s| {
                            s.message = Some(reason.to_string());
                        })
                        .await;
                }
                StepState::Waiting if status.attempt == 0 => {
                    run.handle
                        .transition_step(&status.step_id, StepState::Skipped, |s| {
                            s.message = Some("not started".to_string());
                        })
                        .await;
                }
                StepState::Waiting | StepState::Running if interrupted => {
                    settle_interrupted(run, &status.step_id).await;
                }
                StepState::Waiting | StepState::Running => {
                    settle_stranded(run, &status.step_id).await;
                }
                StepState::Completed
                | StepState::Failed
                | StepState::Skipped
                | StepState::TimedOut => {}
            }
        }

        let snapshot = run.handle.snapshot().await;
        let state = if run.deadline_hit() {
            WorkflowState::TimedOut
        } else if run.handle.token().is_cancelled() {
            WorkflowState::Cancelled
        } else if run.was_halted() || !run.critical_steps_completed(&snapshot) {
            WorkflowState::Failed
        } else {
            WorkflowState::Completed
        };

        let completed_at = Utc::now();
        let status = run
            .handle
            .update(|s| {
                s.state = state;
                s.completed_at = Some(completed_at);
            })
            .await;

        let duration = started.elapsed();
        self.metrics.record_duration("workflow.duration", duration);
        if state == WorkflowState::Completed {
            self.metrics.increment("workflows.completed", 1);
        } else {
            self.metrics.increment("workflows.failed", 1);
        }

        let errors = run.errors().await;
        info!(
            instance_id = %run.context.instance_id,
            state = %state,
            errors = errors.len(),
            duration_ms = duration.as_millis(),
            "Workflow finished"
        );

        let result = WorkflowResult {
            instance_id: run.context.instance_id.clone(),
            workflow_id: run.definition.id.clone(),
            success: state == WorkflowState::Completed,
            state,
            step_results: run.step_results(&status).await,
            errors,
            variables: run.variables().await,
            started_at: status.started_at.unwrap_or(completed_at),
            completed_at,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        };

        self.tracker.purge_expired().await;
        result
    }
}
