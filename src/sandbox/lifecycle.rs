//! Per-session lifecycle state machine.
//!
//! ```text
//! idle --run--> running --stop--> stopping --drained--> stopped
//!   |              |
//!   +---crash------+-----------> crashed
//! ```
//!
//! `stopped` and `crashed` are terminal. A repeated `stop` is a no-op.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Crashed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Events that drive the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Strategy evaluated, scheduling starts.
    Run,
    /// Host asked for a graceful halt.
    Stop,
    /// No tick in flight any more after a stop.
    Drained,
    /// Uncaught failure during evaluation or a fatal tick.
    Crash,
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed { from: SessionState, to: SessionState },
    /// Duplicate stop; nothing happened.
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition {transition:?} from state {from}")]
    InvalidTransition {
        from: SessionState,
        transition: Transition,
    },
}

/// Lifecycle bookkeeping for one session.
#[derive(Debug)]
pub struct Lifecycle {
    state: SessionState,
    tick_count: u64,
    cancel_requested: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            tick_count: 0,
            cancel_requested: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// Apply a transition, leaving the state untouched on error.
    pub fn apply(&mut self, transition: Transition) -> Result<Applied, LifecycleError> {
        use SessionState::*;

        let next = match (self.state, transition) {
            (Idle, Transition::Run) => Running,
            (Idle, Transition::Crash) | (Running, Transition::Crash) => Crashed,
            (Running, Transition::Stop) => {
                self.cancel_requested = true;
                Stopping
            }
            (Stopping | Stopped | Crashed, Transition::Stop) => return Ok(Applied::Ignored),
            (Stopping, Transition::Drained) => Stopped,
            (from, transition) => {
                return Err(LifecycleError::InvalidTransition { from, transition });
            }
        };

        let from = self.state;
        self.state = next;
        Ok(Applied::Changed { from, to: next })
    }

    /// Claim the next tick number, or `None` once scheduling must end.
    pub fn begin_tick(&mut self) -> Option<u64> {
        if self.cancel_requested || self.state != SessionState::Running {
            return None;
        }
        self.tick_count += 1;
        Some(self.tick_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), SessionState::Idle);

        lifecycle.apply(Transition::Run).unwrap();
        assert_eq!(lifecycle.begin_tick(), Some(1));
        assert_eq!(lifecycle.begin_tick(), Some(2));

        let applied = lifecycle.apply(Transition::Stop).unwrap();
        assert_eq!(
            applied,
            Applied::Changed {
                from: SessionState::Running,
                to: SessionState::Stopping
            }
        );
        assert!(lifecycle.cancel_requested());

        lifecycle.apply(Transition::Drained).unwrap();
        assert_eq!(lifecycle.state(), SessionState::Stopped);
        assert_eq!(lifecycle.tick_count(), 2);
    }

    #[test]
    fn test_duplicate_stop_is_ignored() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.apply(Transition::Run).unwrap();
        lifecycle.apply(Transition::Stop).unwrap();

        assert_eq!(lifecycle.apply(Transition::Stop), Ok(Applied::Ignored));
        lifecycle.apply(Transition::Drained).unwrap();
        assert_eq!(lifecycle.apply(Transition::Stop), Ok(Applied::Ignored));
        assert_eq!(lifecycle.state(), SessionState::Stopped);
    }

    #[test]
    fn test_no_tick_after_cancel() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.apply(Transition::Run).unwrap();
        assert_eq!(lifecycle.begin_tick(), Some(1));

        lifecycle.apply(Transition::Stop).unwrap();
        assert_eq!(lifecycle.begin_tick(), None);
        assert_eq!(lifecycle.tick_count(), 1);
    }

    #[test]
    fn test_compile_failure_crashes_from_idle() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.apply(Transition::Crash).unwrap();

        assert_eq!(lifecycle.state(), SessionState::Crashed);
        assert!(lifecycle.state().is_terminal());
        assert_eq!(lifecycle.begin_tick(), None);
    }

    #[test]
    fn test_terminal_states_reject_run() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.apply(Transition::Run).unwrap();
        lifecycle.apply(Transition::Crash).unwrap();

        let err = lifecycle.apply(Transition::Run).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidTransition {
                from: SessionState::Crashed,
                transition: Transition::Run
            }
        );
        assert_eq!(lifecycle.state(), SessionState::Crashed);
        // stop on a crashed session is still harmless
        assert_eq!(lifecycle.apply(Transition::Stop), Ok(Applied::Ignored));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.apply(Transition::Stop).is_err());
        assert!(lifecycle.apply(Transition::Drained).is_err());

        lifecycle.apply(Transition::Run).unwrap();
        assert!(lifecycle.apply(Transition::Run).is_err());
        assert!(lifecycle.apply(Transition::Drained).is_err());
        assert_eq!(lifecycle.state(), SessionState::Running);
    }
}
