//! Execution records and their state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque execution identifier. Generated at submission and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Why a running execution was forcibly terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    Cancelled,
    MemoryLimit,
    OutputLimit,
    Orphaned,
}

impl KillReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::MemoryLimit => "memory_limit",
            Self::OutputLimit => "output_limit",
            Self::Orphaned => "orphaned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Provisioning,
    Running { pid: u32 },
    Completed { exit_code: i32 },
    TimedOut,
    Killed { reason: KillReason },
    LaunchFailed { message: String },
    /// No program ran to completion because of a provisioning error or an
    /// orchestrator fault.
    Failed { message: String },
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Pending | Self::Provisioning | Self::Running { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::TimedOut => "timed_out",
            Self::Killed { .. } => "killed",
            Self::LaunchFailed { .. } => "launch_failed",
            Self::Failed { .. } => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Provisioning => 1,
            Self::Running { .. } => 2,
            _ => 3,
        }
    }

    /// Non-terminal states only move forward; any state may end the execution.
    pub fn can_advance_to(&self, next: &ExecutionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed { exit_code } => Some(*exit_code),
            _ => None,
        }
    }
}

/// A validated submission as accepted by the registry.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: crate::sandbox::Language,
    pub code: String,
    pub timeout_seconds: u64,
    pub memory_mb: u64,
}

/// Point-in-time view of an execution, safe to hand to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub language: crate::sandbox::Language,
    pub timeout_seconds: u64,
    pub memory_mb: u64,
    #[serde(flatten)]
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output_bytes: u64,
    pub backend: Option<String>,
}
