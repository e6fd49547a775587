use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

/// Stage of one calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RunState {
    AwaitingCapture,
    AcquiringMask,
    Rectifying,
    Extracting,
    Scoring,
    Selecting,
    Completed,
    Failed(ErrorKind),
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// The only non-failure successor, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::AwaitingCapture => Some(Self::AcquiringMask),
            Self::AcquiringMask => Some(Self::Rectifying),
            Self::Rectifying => Some(Self::Extracting),
            Self::Extracting => Some(Self::Scoring),
            Self::Scoring => Some(Self::Selecting),
            Self::Selecting => Some(Self::Completed),
            Self::Completed | Self::Failed(_) => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::AwaitingCapture => "awaiting_capture",
            Self::AcquiringMask => "acquiring_mask",
            Self::Rectifying => "rectifying",
            Self::Extracting => "extracting",
            Self::Scoring => "scoring",
            Self::Selecting => "selecting",
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed({kind})"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal run transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunState,
    pub to: RunState,
}

/// Sequential run state with its visited history.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: RunState,
    history: Vec<RunState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::AwaitingCapture,
            history: vec![RunState::AwaitingCapture],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// Move to `to`: either the next stage or `Failed`, never out of a terminal state.
    pub fn transition(&mut self, to: RunState) -> Result<(), TransitionError> {
        let from = self.state;
        let legal = !from.is_terminal()
            && (matches!(to, RunState::Failed(_)) || from.next() == Some(to));
        if !legal {
            return Err(TransitionError { from, to });
        }
        match to {
            RunState::Failed(kind) => tracing::warn!("run state {from} -> failed({kind})"),
            _ => tracing::info!("run state {from} -> {to}"),
        }
        self.state = to;
        self.history.push(to);
        Ok(())
    }

    /// Advance to the next stage.
    pub fn advance(&mut self) -> Result<RunState, TransitionError> {
        let next = self.state.next().ok_or(TransitionError {
            from: self.state,
            to: self.state,
        })?;
        self.transition(next)?;
        Ok(next)
    }

    pub fn fail(&mut self, kind: ErrorKind) -> Result<(), TransitionError> {
        self.transition(RunState::Failed(kind))
    }
}
