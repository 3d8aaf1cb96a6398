use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionId, ExecutionState, KillReason};

/// Which pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Status carried by the terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Success,
    Error,
    Timeout,
    Killed,
    LaunchFailed,
}

/// Final outcome of an execution as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub status: TerminalStatus,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub reason: Option<KillReason>,
    pub error: Option<String>,
}

impl Completion {
    /// Build the completion for a terminal state. Returns `None` for live states.
    pub fn from_state(state: &ExecutionState, execution_time_ms: u64) -> Option<Self> {
        let (status, exit_code, reason, error) = match state {
            ExecutionState::Pending
            | ExecutionState::Provisioning
            | ExecutionState::Running { .. } => return None,
            ExecutionState::Completed { exit_code: 0 } => {
                (TerminalStatus::Success, Some(0), None, None)
            }
            ExecutionState::Completed { exit_code } => {
                (TerminalStatus::Error, Some(*exit_code), None, None)
            }
            ExecutionState::TimedOut => (TerminalStatus::Timeout, None, None, None),
            ExecutionState::Killed { reason } => {
                (TerminalStatus::Killed, None, Some(*reason), None)
            }
            ExecutionState::LaunchFailed { message } => {
                (TerminalStatus::LaunchFailed, None, None, Some(message.clone()))
            }
            ExecutionState::Failed { message } => {
                (TerminalStatus::Error, None, None, Some(message.clone()))
            }
        };

        Some(Self {
            status,
            exit_code,
            execution_time_ms,
            reason,
            error,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Stdout(String),
    Stderr(String),
    Terminal(Completion),
}

impl EventKind {
    pub fn output(stream: StreamKind, text: String) -> Self {
        match stream {
            StreamKind::Stdout => Self::Stdout(text),
            StreamKind::Stderr => Self::Stderr(text),
        }
    }
}

/// An immutable, ordered unit of output or status for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub execution_id: ExecutionId,
    pub seq: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Terminal(_))
    }

    pub fn payload_len(&self) -> usize {
        match &self.kind {
            EventKind::Stdout(s) | EventKind::Stderr(s) => s.len(),
            EventKind::Terminal(_) => 0,
        }
    }

    pub fn completion(&self) -> Option<&Completion> {
        match &self.kind {
            EventKind::Terminal(c) => Some(c),
            _ => None,
        }
    }
}
