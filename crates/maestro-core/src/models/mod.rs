//! Data model for workflows, their runtime context, status and results.

pub mod context;
pub mod duration;
pub mod result;
pub mod status;
pub mod workflow;

pub use context::WorkflowContext;
pub use result::{ErrorCode, ErrorSeverity, StepResult, WorkflowError, WorkflowResult};
pub use status::{StepState, StepStatus, WorkflowState, WorkflowStatus};
pub use workflow::{ErrorHandlingMode, FeedbackEdge, WorkflowDefinition, WorkflowStep, WorkflowType};
