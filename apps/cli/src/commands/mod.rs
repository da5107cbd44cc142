//! Command implementations for the Maestro CLI.
//!
//! Each command returns `Ok(true)` when it succeeded and `Ok(false)` when
//! it ran but the outcome should make the process exit non-zero.

pub mod assign;
pub mod run;
pub mod validate;
