//! Typed error hierarchy for the VM.

use crate::ids::{ContId, DispatchId};
use crate::value::Value;
use std::fmt;

/// A value rejected at a public boundary, plus a hint for how to fix it.
#[derive(Debug, Clone)]
pub struct BoundaryError {
    pub offending: Value,
    pub hint: String,
}

impl fmt::Display for BoundaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value at VM boundary: {}", self.hint)
    }
}

impl std::error::Error for BoundaryError {}

impl BoundaryError {
    pub fn new(offending: Value, hint: impl Into<String>) -> Self {
        Self {
            offending,
            hint: hint.into(),
        }
    }
}

/// Every way a run can fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    #[error("no handler matched effect {effect:?}")]
    UnhandledEffect { effect: Value },

    #[error("continuation {cont_id:?} was already used by a prior Resume or Transfer")]
    ContinuationAlreadyUsed { cont_id: ContId },

    #[error("handler for dispatch {dispatch_id:?} returned a value that is not a DoExpr")]
    HandlerReturnedNonDoExpr { dispatch_id: DispatchId },

    #[error("host callable failed: {message}")]
    HostCallFailed {
        message: String,
        traceback: Option<String>,
    },

    #[error("scheduler deadlock: ready queue is empty but {waiting} task(s) remain blocked")]
    SchedulerDeadlock { waiting: usize },

    #[error("internal VM invariant violated: {message}")]
    InternalInvariant { message: String },
}

impl VmError {
    pub fn unhandled_effect(effect: Value) -> Self {
        VmError::UnhandledEffect { effect }
    }

    pub fn continuation_already_used(cont_id: ContId) -> Self {
        VmError::ContinuationAlreadyUsed { cont_id }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VmError::InternalInvariant {
            message: message.into(),
        }
    }

    pub fn host_call_failed(message: impl Into<String>) -> Self {
        VmError::HostCallFailed {
            message: message.into(),
            traceback: None,
        }
    }

    /// Whether this error is catchable by an enclosing `Safe(expr)` boundary.
    /// Uncaught errors propagate until a `Safe` boundary or run exit.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, VmError::InternalInvariant { .. })
    }
}
