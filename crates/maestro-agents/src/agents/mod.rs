//! Built-in agent implementations.

pub mod scripted;

pub use scripted::{AttemptRecord, ScriptedAgent, ScriptedAgentSpec};
