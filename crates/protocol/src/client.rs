//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
///
/// Events that expect an acknowledgement carry a client-chosen `request_id`;
/// the server answers with exactly one [`crate::ServerMessage::Ack`] per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    // Rooms
    JoinRoom {
        project_id: String,
    },
    LeaveRoom {
        project_id: String,
    },

    // Actions
    SendMessage {
        request_id: String,
        project_id: String,
        content: String,
    },
    /// `status` stays a raw string so an unknown literal is acked as a
    /// validation failure instead of being rejected as a malformed frame.
    UpdateTaskStatus {
        request_id: String,
        task_id: String,
        status: String,
    },
}

impl ClientMessage {
    /// Wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::SendMessage { .. } => "send-message",
            ClientMessage::UpdateTaskStatus { .. } => "update-task-status",
        }
    }
}
