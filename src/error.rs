//! Error taxonomy for the session and automation engine.
//!
//! Every variant carries a human-readable reason; callers never get a bare
//! boolean for a refused action.

use crate::serializer::Writer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The child process could not be launched. Fatal to the start request.
    #[error("failed to spawn session: {0}")]
    Spawn(String),

    /// A write or control request arrived while no session accepts input.
    #[error("no session is running")]
    SessionNotRunning,

    /// The policy engine refused the input or command.
    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },

    /// A plan failed validation and was rejected.
    #[error("plan rejected: {reason}")]
    PlanValidation { reason: String },

    /// Another writer currently owns the session input.
    #[error("execution lock is held by {holder}")]
    ExecutionLockBusy { holder: Writer },

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("plan {id} cannot move from {from} to {to}")]
    InvalidPlanTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable identifier used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "spawn_error",
            Self::SessionNotRunning => "session_not_running",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::PlanValidation { .. } => "plan_validation_error",
            Self::ExecutionLockBusy { .. } => "execution_lock_busy",
            Self::PlanNotFound(_) => "plan_not_found",
            Self::InvalidPlanTransition { .. } => "invalid_plan_transition",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether a caller may retry the same request after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ExecutionLockBusy { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
