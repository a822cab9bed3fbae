use std::fmt;

use thiserror::Error;

/// Lifecycle of one sandbox. `Faulted` is terminal: a faulted sandbox is
/// discarded and a new one created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SandboxState {
    Uninitialized,
    Loading,
    Ready,
    Running,
    Faulted,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Uninitialized => "uninitialized",
            SandboxState::Loading => "loading",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::Faulted => "faulted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Faulted)
    }

    /// Apply `event`, returning the next state or the rejected edge.
    pub fn transition(self, event: SandboxEvent) -> Result<SandboxState, TransitionError> {
        use SandboxEvent as E;
        use SandboxState as S;

        let next = match (self, event) {
            (S::Faulted, _) => None,
            (_, E::Fault) => Some(S::Faulted),
            (S::Uninitialized, E::Load) => Some(S::Loading),
            (S::Loading, E::Load) => Some(S::Loading),
            (S::Ready, E::Load) => Some(S::Ready),
            (S::Running, E::Load) => Some(S::Running),
            (S::Loading, E::Loaded) => Some(S::Ready),
            (S::Ready, E::Run) => Some(S::Running),
            (S::Running, E::Completed) => Some(S::Ready),
            _ => None,
        };
        next.ok_or(TransitionError { from: self, event })
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxEvent {
    Load,
    Loaded,
    Run,
    Completed,
    Fault,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("sandbox cannot handle {event:?} while {from}")]
pub struct TransitionError {
    pub from: SandboxState,
    pub event: SandboxEvent,
}
