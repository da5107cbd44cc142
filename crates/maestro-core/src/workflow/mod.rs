//! Workflow validation and execution.
//!
//! This module provides the condition language, the dependency graph,
//! definition validation, per-instance status tracking and the execution
//! engine with one scheduler per workflow type.

pub mod condition;
pub mod dag;
pub mod engine;
mod run;
mod scheduler;
mod step;
pub mod tracker;
pub mod validation;

pub use condition::{Condition, ConditionError};
pub use dag::{DagError, DependencyGraph};
pub use engine::{EngineError, ExecutionEngine, PreparedRun};
pub use tracker::{CancelOutcome, RetentionPolicy, StatusHandle, StatusTracker, TrackerError};
pub use validation::{ValidationError, ValidationOptions, validate, validate_with};
