//! # State Machine Error Types
//!
//! Structured error handling for the engine using thiserror. User hook
//! failures travel as opaque `anyhow::Error` values and are wrapped into
//! [`StateMachineError::State`] at the engine boundary.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Convenient result alias for engine operations.
pub type Result<T> = std::result::Result<T, StateMachineError>;

/// Errors surfaced by the state machine engine.
#[derive(Debug, Error)]
pub enum StateMachineError {
    /// The machine is misconfigured (initial state unset or unused,
    /// empty transition source set).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `start()` was called on a machine that has already been started.
    #[error("state machine is already started")]
    AlreadyStarted,

    /// A lifecycle operation requires a running machine.
    #[error("state machine is not alive")]
    NotAlive,

    /// A manual trigger was attempted while the machine is halted.
    #[error("state machine is halted")]
    Halted,

    /// The transition is not eligible from the current state.
    #[error("invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    /// A non-blocking or timed acquisition contended with another holder.
    #[error("state machine is busy")]
    Busy,

    /// A combined wait-and-reserve deadline expired.
    #[error("timed out waiting for {operation}")]
    Timeout { operation: &'static str },

    /// A state hook or transition callback failed. The machine has been
    /// halted (except for `on_exit` failures) and the error handler has
    /// already run by the time this reaches the caller.
    #[error("state error in {phase}: {source}")]
    State {
        phase: HookPhase,
        #[source]
        source: anyhow::Error,
    },
}

impl StateMachineError {
    pub(crate) fn state(phase: HookPhase, source: anyhow::Error) -> Self {
        Self::State { phase, source }
    }
}

/// The hook or callback a state error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Callback,
    PrepareEntry,
    OnEntry,
    OnExit,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback => write!(f, "callback"),
            Self::PrepareEntry => write!(f, "prepare_entry"),
            Self::OnEntry => write!(f, "on_entry"),
            Self::OnExit => write!(f, "on_exit"),
        }
    }
}

/// Failure context handed to the machine's error handler hook.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    /// Which hook failed.
    pub phase: HookPhase,
    /// Display rendering of the failure.
    pub message: String,
    /// Full error chain text.
    pub trace: String,
}

impl ErrorInfo {
    pub(crate) fn new(phase: HookPhase, error: &anyhow::Error) -> Self {
        Self {
            phase,
            message: error.to_string(),
            trace: format!("{error:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_error_display() {
        let err = StateMachineError::InvalidTransition {
            from: "A".to_string(),
            to: "B".to_string(),
        };
        assert_eq!(err.to_string(), "invalid state transition from 'A' to 'B'");

        let err = StateMachineError::state(HookPhase::OnEntry, anyhow!("boom"));
        assert_eq!(err.to_string(), "state error in on_entry: boom");
    }

    #[test]
    fn test_error_info_captures_chain() {
        let cause = anyhow!("root cause").context("while doing work");
        let info = ErrorInfo::new(HookPhase::PrepareEntry, &cause);
        assert_eq!(info.message, "while doing work");
        assert!(info.trace.contains("root cause"));
    }

    #[test]
    fn test_hook_phase_serde() {
        let json = serde_json::to_string(&HookPhase::PrepareEntry).unwrap();
        assert_eq!(json, "\"prepare_entry\"");
    }
}
