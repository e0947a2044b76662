//! Domain-specific error types for screen capture.
//!
//! All fallible operations return `Result<T, CaptureError>`.
//! Frame consumers only ever see a frame or [`CaptureError::Cancelled`];
//! raw socket faults are absorbed by the reader loop.

use std::time::Duration;
use thiserror::Error;

use crate::state::RunningState;

/// The canonical error type for the capture pipeline.
#[derive(Debug, Error)]
pub enum CaptureError {
    // ── Lifecycle Errors ─────────────────────────────────────────
    /// An operation was invoked in a state that does not allow it.
    #[error("cannot {operation}: component is {state}")]
    InvalidState {
        operation: &'static str,
        state: RunningState,
    },

    /// `wait_running` observed the server fall back to `Ready`.
    #[error("capture server not started")]
    NotStarted,

    /// `wait_running` observed the server reach `Closed`.
    #[error("capture server closed")]
    Closed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A blocked `take` was woken by `close` instead of a frame.
    #[error("frame queue closed")]
    Cancelled,

    // ── Connection Errors ────────────────────────────────────────
    /// The socket or process I/O layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    // ── Device Errors ────────────────────────────────────────────
    /// A device-side collaborator (push, chmod, forward, shell) failed.
    #[error("device error: {0}")]
    Device(String),

    /// Device introspection output could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    // ── Configuration Errors ─────────────────────────────────────
    /// A projection parameter is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CaptureError {
    pub(crate) fn invalid_state(operation: &'static str, state: RunningState) -> Self {
        CaptureError::InvalidState { operation, state }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for CaptureError {
    fn from(s: String) -> Self {
        CaptureError::Other(s)
    }
}

impl From<&str> for CaptureError {
    fn from(s: &str) -> Self {
        CaptureError::Other(s.to_string())
    }
}

impl From<std::num::ParseIntError> for CaptureError {
    fn from(e: std::num::ParseIntError) -> Self {
        CaptureError::Parse(e.to_string())
    }
}
