pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod server;
pub mod stream;
pub mod supervisor;

pub use error::{Result, RunletError};
pub use execution::{Execution, ExecutionId, ExecutionState, KillReason};
pub use orchestrator::{Orchestrator, SubmitRequest};
pub use stream::{Completion, Event, EventKind, TerminalStatus};
