//! Typed wire messages.
//!
//! Everything the agent, the router and computation subprocesses say to each
//! other beyond opaque application payloads. Each type carries its own
//! [`MessageClass`] and routing name via the [`WireMessage`] impl.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::envelope::{MessageClass, WireMessage};

macro_rules! wire_message {
    ($ty:ty, $class:expr, $name:literal) => {
        impl WireMessage for $ty {
            const CLASS: MessageClass = $class;
            const ROUTING_NAME: &'static str = $name;
        }
    };
}

/// Control command directed at a single computation (or the router itself).
///
/// Known commands: `go`, `update`, `stop`, `disconnect`, `routershutdown`.
/// `data` carries a JSON document when the command needs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: String,
    pub data: String,
}

wire_message!(ControlMessage, MessageClass::Control, "ControlMessage");

impl ControlMessage {
    pub fn new(command: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: data.into(),
        }
    }
}

/// Periodic performance sample sent by a computation subprocess.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorHeartbeat {
    pub transmit_secs: i64,
    pub transmit_usecs: i64,
    pub threads: u32,
    pub hyperthreaded: bool,
    pub cpu_usage_5s: f32,
    pub cpu_usage_60s: f32,
    pub cpu_usage_total_secs: f64,
    pub memory_usage_bytes: u64,
    pub sent_messages_5s: u64,
    pub sent_messages_60s: u64,
    pub sent_messages_total: u64,
    pub received_messages_5s: u64,
    pub received_messages_60s: u64,
    pub received_messages_total: u64,
    pub status: String,
}

wire_message!(
    ExecutorHeartbeat,
    MessageClass::ExecutorHeartbeat,
    "ExecutorHeartbeat"
);

/// Reply to an application-level ping; handled locally, never forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMessage {
    pub payload: Vec<u8>,
}

wire_message!(PongMessage, MessageClass::Pong, "PongMessage");

/// Final session status delivered to a client before disconnect.
///
/// The body is a JSON document with `disconnectReason`, `execStatus` and
/// `execStoppedReason` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusMessage {
    pub status_json: String,
}

wire_message!(
    SessionStatusMessage,
    MessageClass::SessionStatus,
    "SessionStatusMessage"
);

/// Tells the client the session's engine is ready. Carries no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineReadyMessage {}

wire_message!(
    EngineReadyMessage,
    MessageClass::EngineReady,
    "EngineReadyMessage"
);

/// Client connect/disconnect notification, and (service -> router) a request
/// to kick the client with a final status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnectionStatus {
    pub session_id: Uuid,
    pub reason: String,
    pub session_status: String,
}

wire_message!(
    ClientConnectionStatus,
    MessageClass::ClientConnectionStatus,
    "ClientConnectionStatus"
);

/// Router -> service notification that a computation registered on the IPC
/// socket. The status is always "ready".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationStatusMessage {
    pub session_id: Uuid,
    pub computation_id: Uuid,
    pub status: String,
}

wire_message!(
    ComputationStatusMessage,
    MessageClass::ComputationStatus,
    "ComputationStatusMessage"
);

/// Router -> service reply carrying the router's TCP message port, sent
/// immediately after the control channel registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInfoMessage {
    pub message_port: u16,
}

wire_message!(RouterInfoMessage, MessageClass::RouterInfo, "RouterInfoMessage");

/// Action carried by a [`SessionRoutingDataMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRoutingAction {
    /// Create routing data at session startup.
    Initialize,
    /// Update routing data for a running session (client addresser only).
    Update,
    /// Free routing data; `routing_data` is unused.
    Delete,
    /// Acknowledge receipt of routing data (router -> service).
    Acknowledge,
}

/// Service <-> router exchange installing, updating, deleting and
/// acknowledging per-session routing data. `routing_data` is the JSON routing
/// document rendered as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRoutingDataMessage {
    pub action: SessionRoutingAction,
    pub session_id: Uuid,
    pub routing_data: String,
}

wire_message!(
    SessionRoutingDataMessage,
    MessageClass::SessionRoutingData,
    "SessionRoutingDataMessage"
);

impl SessionRoutingDataMessage {
    pub fn new(action: SessionRoutingAction, session_id: Uuid) -> Self {
        Self {
            action,
            session_id,
            routing_data: String::new(),
        }
    }

    pub fn with_routing(
        action: SessionRoutingAction,
        session_id: Uuid,
        routing: impl Into<String>,
    ) -> Self {
        Self {
            action,
            session_id,
            routing_data: routing.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::Envelope;

    #[test]
    fn test_routing_data_message_round_trip() {
        let msg = SessionRoutingDataMessage::with_routing(
            SessionRoutingAction::Initialize,
            Uuid::new_v4(),
            r#"{"nodes":{}}"#,
        );
        let env = Envelope::pack(&msg).unwrap();
        let back: SessionRoutingDataMessage = env.unpack().unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_computation_status_serializes_status_field() {
        // the status field is part of the wire format and survives a round trip
        let msg = ComputationStatusMessage {
            session_id: Uuid::new_v4(),
            computation_id: Uuid::new_v4(),
            status: "ready".to_string(),
        };
        let bytes = postcard::to_stdvec(&msg).unwrap();
        let back: ComputationStatusMessage = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.status, "ready");
    }

    #[test]
    fn test_heartbeat_defaults() {
        let hb = ExecutorHeartbeat::default();
        assert_eq!(hb.sent_messages_total, 0);
        assert!(!hb.hyperthreaded);
    }
}
