//! Event messages delivered by the privileged service.

use serde::{Deserialize, Serialize};

use super::{EventType, ProcessDescriptor};

/// Whether the service expects a resolution for the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Auth,
    Notify,
}

/// A security event as transported to the client.
///
/// The event-specific payload is kept as an opaque JSON value; interpreting it
/// is up to the handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub version: u32,
    pub seq_num: u64,
    /// Nanoseconds since the Unix epoch.
    pub time: u64,
    pub event_type: EventType,
    pub action: ActionKind,
    pub process: ProcessDescriptor,
    #[serde(default)]
    pub event: serde_json::Value,
}

impl EventMessage {
    /// Creates a notification message with an empty payload.
    #[must_use]
    pub fn notify(event_type: EventType, process: ProcessDescriptor) -> Self {
        Self {
            version: 1,
            seq_num: 0,
            time: 0,
            event_type,
            action: ActionKind::Notify,
            process,
            event: serde_json::Value::Null,
        }
    }

    /// Creates an authorization message with an empty payload.
    #[must_use]
    pub fn auth(event_type: EventType, process: ProcessDescriptor) -> Self {
        Self {
            action: ActionKind::Auth,
            ..Self::notify(event_type, process)
        }
    }

    #[must_use]
    pub fn with_payload(mut self, event: serde_json::Value) -> Self {
        self.event = event;
        self
    }
}
