//! Output multiplexing: per-execution event channels with bounded,
//! drop-on-overflow subscriber queues and a replay buffer.

mod channel;
mod event;

pub use channel::{ExecutionChannel, Subscription};
pub use event::{Completion, Event, EventKind, StreamKind, TerminalStatus};
