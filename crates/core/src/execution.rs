//! Execution status state machine and identifier rules.
//!
//! An execution moves `Pending -> Running <-> Paused -> {Completed, Failed}`.
//! The terminal edge is one-way: once an execution is `Completed` or
//! `Failed`, no further transition is honoured.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Prefixes the editor uses for executions that have not been assigned a
/// server id yet. These never have a push channel or a status endpoint.
pub const TEMPORARY_ID_PREFIXES: &[&str] = &["pending-", "temp-"];

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Wire representation, e.g. `"running"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// `Completed` and `Failed` end the execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Validate a transition from `self` to `next`.
    ///
    /// Returns `next` when the edge exists in the state machine. Repeating
    /// the current status is always allowed so that duplicate reports from
    /// the push channel and the poller are harmless.
    pub fn transition_to(self, next: ExecutionStatus) -> Result<ExecutionStatus, CoreError> {
        use ExecutionStatus::*;

        let allowed = match (self, next) {
            (from, to) if from == to => true,
            (Completed | Failed, _) => false,
            (Pending, _) => true,
            (Running | Paused, Pending) => false,
            (Running | Paused, _) => true,
        };

        if allowed {
            Ok(next)
        } else {
            Err(CoreError::IllegalTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::UnknownStatus(s.to_string())),
        }
    }
}

/// Whether `id` is a client-side placeholder rather than a server id.
pub fn is_temporary_execution_id(id: &str) -> bool {
    TEMPORARY_ID_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

/// Reject ids that cannot address a server-side execution.
pub fn validate_execution_id(id: &str) -> Result<(), CoreError> {
    if id.trim().is_empty() {
        return Err(CoreError::InvalidExecutionId(id.to_string()));
    }
    Ok(())
}
