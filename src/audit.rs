//! Audit log interface
//!
//! The bridge exists so that sessions against non-cooperating SSH servers
//! still leave an audit trail. It does not store anything itself: events
//! are handed to the cluster's [`AuditLog`] sink as structured field maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Event kind emitted for every accepted `direct-tcpip` channel.
pub const PORT_FORWARD_EVENT: &str = "port";
/// Event kind emitted when an interactive session starts.
pub const SESSION_START_EVENT: &str = "session.start";
/// Event kind emitted when a party joins an existing session.
pub const SESSION_JOIN_EVENT: &str = "session.join";
/// Event kind emitted when the last party leaves a session.
pub const SESSION_END_EVENT: &str = "session.end";
/// Event kind emitted on a terminal size change.
pub const RESIZE_EVENT: &str = "resize";

/// Field: target address of a port forward.
pub const PORT_FORWARD_ADDR: &str = "addr";
/// Field: system login the action was performed as.
pub const EVENT_LOGIN: &str = "login";
/// Field: local address of the upstream connection.
pub const LOCAL_ADDR: &str = "addr.local";
/// Field: remote (user-side) address of the upstream connection.
pub const REMOTE_ADDR: &str = "addr.remote";
/// Field: session identifier.
pub const SESSION_ID: &str = "sid";
/// Field: terminal size serialized as `{cols}:{rows}`.
pub const TERMINAL_SIZE: &str = "size";

/// A structured audit event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub kind: String,
    pub time: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            time: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }
}

/// Sink for structured audit events.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn emit_audit_event(&self, event: AuditEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_field_map() {
        let event = AuditEvent::new(PORT_FORWARD_EVENT)
            .with(PORT_FORWARD_ADDR, "127.0.0.1:9000")
            .with(EVENT_LOGIN, "alice");
        assert_eq!(event.kind, PORT_FORWARD_EVENT);
        assert_eq!(event.fields[PORT_FORWARD_ADDR], "127.0.0.1:9000");
        assert_eq!(event.fields[EVENT_LOGIN], "alice");
    }
}
