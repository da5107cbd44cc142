//! Live status of workflow instances and their steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Accepted but not yet scheduling.
    NotStarted,
    /// Scheduling steps.
    Running,
    /// Suspended by the host.
    Paused,
    /// Finished and every critical step completed.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Stopped on request.
    Cancelled,
    /// Stopped by the workflow deadline.
    TimedOut,
}

impl WorkflowState {
    /// Returns true once the instance can no longer change.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not yet considered.
    NotStarted,
    /// Waiting for a concurrency slot, a retry backoff or a fallback.
    Waiting,
    /// An attempt is in flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Never executed.
    Skipped,
    /// The last attempt ran out of time.
    TimedOut,
}

impl StepState {
    /// Returns true once the step has an outcome.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::TimedOut)
    }

    /// Whether the forward transition `self -> next` is allowed.
    ///
    /// `Running -> Running` is the retry re-entry and must come with a
    /// higher attempt number.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use StepState::{Completed, Failed, NotStarted, Running, Skipped, TimedOut, Waiting};
        match self {
            NotStarted => matches!(next, Waiting | Running | Skipped | Failed | TimedOut),
            Waiting => matches!(next, Running | Completed | Failed | Skipped | TimedOut),
            Running => matches!(next, Running | Waiting | Completed | Failed | TimedOut),
            Completed | Failed | Skipped | TimedOut => false,
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Status of one step within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    /// Step id.
    pub step_id: String,
    /// Current state.
    pub state: StepState,
    /// Current attempt, zero before the first one.
    pub attempt: u32,
    /// Feedback re-entries so far.
    #[serde(default)]
    pub iteration: u32,
    /// Agent running or last running the step.
    pub agent_id: Option<String>,
    /// First time the step entered Running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step settled.
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest note, e.g. a failure reason.
    pub message: Option<String>,
}

impl StepStatus {
    /// Fresh status for `step_id`.
    #[must_use]
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            state: StepState::NotStarted,
            attempt: 0,
            iteration: 0,
            agent_id: None,
            started_at: None,
            completed_at: None,
            message: None,
        }
    }
}

/// Status of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Instance id.
    pub instance_id: String,
    /// Definition id.
    pub workflow_id: String,
    /// Definition name.
    pub workflow_name: String,
    /// Current state.
    pub state: WorkflowState,
    /// Most recently started step.
    pub current_step: Option<String>,
    /// Settled steps as a percentage of all steps.
    pub progress: f64,
    /// Per-step status in declaration order.
    pub steps: Vec<StepStatus>,
    /// When the instance began running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the instance reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When cancellation was requested, if it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

impl WorkflowStatus {
    /// Fresh status for a run of `workflow_id` with the given steps.
    #[must_use]
    pub fn new<I, S>(
        instance_id: impl Into<String>,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        step_ids: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            instance_id: instance_id.into(),
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            state: WorkflowState::NotStarted,
            current_step: None,
            progress: 0.0,
            steps: step_ids.into_iter().map(StepStatus::new).collect(),
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
            cancel_requested_at: None,
        }
    }

    /// Looks up a step.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Looks up a step mutably.
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepStatus> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Recomputes `progress` from the step states.
    pub fn recompute_progress(&mut self) {
        if self.steps.is_empty() {
            self.progress = if self.state.is_terminal() { 100.0 } else { 0.0 };
            return;
        }
        let settled = self.steps.iter().filter(|s| s.state.is_settled()).count();
        self.progress = settled as f64 * 100.0 / self.steps.len() as f64;
    }
}
