//! Subscription entry point for external observers, and the JSON shape of
//! events on the wire.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{GatewayError, RegistryError};
use crate::execution::{ExecutionId, KillReason};
use crate::registry::Registry;
use crate::stream::{Event, EventKind, Subscription, TerminalStatus};

pub struct Gateway {
    registry: Arc<Registry>,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Attach to an execution's event stream.
    ///
    /// Unknown ids fail immediately without creating anything. With
    /// `since`, events still buffered after that sequence number are
    /// replayed first.
    pub fn subscribe(
        &self,
        id: &ExecutionId,
        since: Option<u64>,
    ) -> Result<Subscription, GatewayError> {
        self.registry
            .subscribe(id, since)
            .map_err(|e| match e {
                RegistryError::NotFound { id } | RegistryError::InvalidTransition { id, .. } => {
                    GatewayError::NotFound { id }
                }
            })
    }
}

/// An event as delivered to clients.
///
/// `output` carries stdout, `error` carries stderr, and `complete` is the
/// single terminal event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TerminalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<KillReason>,
}

impl WireEvent {
    fn output(kind: &'static str, seq: u64, data: &str) -> Self {
        Self {
            kind,
            seq,
            data: Some(data.to_string()),
            status: None,
            exit_code: None,
            execution_time: None,
            error: None,
            reason: None,
        }
    }
}

impl From<&Event> for WireEvent {
    fn from(event: &Event) -> Self {
        match &event.kind {
            EventKind::Stdout(data) => Self::output("output", event.seq, data),
            EventKind::Stderr(data) => Self::output("error", event.seq, data),
            EventKind::Terminal(c) => Self {
                kind: "complete",
                seq: event.seq,
                data: None,
                status: Some(c.status),
                exit_code: c.exit_code,
                execution_time: Some(c.execution_time_ms),
                error: c.error.clone(),
                reason: c.reason,
            },
        }
    }
}
