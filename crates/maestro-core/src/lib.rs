//! Maestro Core - workflow orchestration on top of the agent layer.
//!
//! This crate provides:
//! - the workflow model (definitions, context, status and results)
//! - definition validation, including cycle detection
//! - the DAG execution engine with per-type schedulers, retries,
//!   fallbacks, timeouts and cooperative cancellation
//! - the [`Orchestrator`] facade hosts call into
//! - TOML configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use maestro_core::{Orchestrator, OrchestratorConfig};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OrchestratorConfig::load_from_file(Path::new("maestro.toml"))?;
//! let orchestrator = Orchestrator::builder().config(config).build()?;
//! # let _ = orchestrator;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod workflow;

pub use config::{ConfigError, ConfigResult, EngineConfig, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use metrics::MetricsGate;
pub use models::{
    ErrorCode, ErrorHandlingMode, ErrorSeverity, FeedbackEdge, StepResult, StepState, StepStatus,
    WorkflowContext, WorkflowDefinition, WorkflowError, WorkflowResult, WorkflowState,
    WorkflowStatus, WorkflowStep, WorkflowType,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use workflow::{
    CancelOutcome, Condition, ConditionError, DagError, DependencyGraph, EngineError,
    ExecutionEngine, PreparedRun, RetentionPolicy, StatusTracker, ValidationError,
    ValidationOptions, validate, validate_with,
};
