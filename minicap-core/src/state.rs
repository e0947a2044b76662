//! Lifecycle state shared by the capture client and the capture server.
//!
//! ```text
//!  Ready ──► Starting ──► Running ──► Closed
//!                ▲           │
//!                └─restart───┘
//! ```
//!
//! Any state may jump straight to `Closed`; nothing leaves `Closed`.
//! The current value lives in a `watch` channel so reads from arbitrary
//! tasks see a consistent value and waiters can subscribe to changes.

use std::fmt;

use tokio::sync::watch;

use crate::error::CaptureError;

// ── RunningState ─────────────────────────────────────────────────

/// The lifecycle phase of a capture component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunningState {
    /// Constructed, not yet started. Initial state.
    #[default]
    Ready,

    /// Started; waiting for the connection or the first helper output.
    Starting,

    /// Streaming (client) or helper confirmed alive (server).
    Running,

    /// Shut down. Terminal.
    Closed,
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// ── StateCell ────────────────────────────────────────────────────

/// Thread-safe holder for a [`RunningState`] with validated transitions.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<RunningState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunningState::Ready);
        Self { tx }
    }

    /// Snapshot of the current state.
    pub fn get(&self) -> RunningState {
        *self.tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.get() == RunningState::Running
    }

    pub fn is_closed(&self) -> bool {
        self.get() == RunningState::Closed
    }

    /// Move from `from` to `to` if the current state is exactly `from`.
    ///
    /// Returns `true` when the transition happened.
    pub fn transition(&self, from: RunningState, to: RunningState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from && *state != RunningState::Closed {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// `Ready → Starting`, or an invalid-state fault naming `operation`.
    pub fn begin_start(&self, operation: &'static str) -> Result<(), CaptureError> {
        if self.transition(RunningState::Ready, RunningState::Starting) {
            Ok(())
        } else {
            Err(CaptureError::invalid_state(operation, self.get()))
        }
    }

    /// `Starting → Running`. Returns `true` on the first call only.
    pub fn mark_running(&self) -> bool {
        self.transition(RunningState::Starting, RunningState::Running)
    }

    /// `Running → Starting`, used when a connection or helper is relaunched.
    pub fn mark_restarting(&self) -> bool {
        self.transition(RunningState::Running, RunningState::Starting)
    }

    /// Force `Closed` from any state and return the previous state.
    pub fn close(&self) -> RunningState {
        let mut previous = RunningState::Closed;
        self.tx.send_if_modified(|state| {
            previous = *state;
            if *state == RunningState::Closed {
                false
            } else {
                *state = RunningState::Closed;
                true
            }
        });
        previous
    }

    /// Resolve once the state satisfies `pred`, returning that state.
    pub async fn wait_for<F>(&self, mut pred: F) -> RunningState
    where
        F: FnMut(RunningState) -> bool,
    {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            Err(_) => self.get(),
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
