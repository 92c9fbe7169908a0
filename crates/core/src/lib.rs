//! Shared domain vocabulary for flowwatch.
//!
//! Execution identifiers, the execution status state machine, and the
//! core error type used across the workspace.

pub mod error;
pub mod execution;
pub mod types;
