//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{TaskStatus, UserSummary};

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    // Direct responses
    Ack {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        message: String,
    },

    // Room presence
    PeerJoined {
        user_id: String,
        project_id: String,
        timestamp: String,
    },
    PeerLeft {
        user_id: String,
        project_id: String,
        timestamp: String,
    },

    // Room broadcasts
    NewMessage {
        id: String,
        content: String,
        sender: UserSummary,
        project_id: String,
        created_at: String,
    },
    TaskUpdated {
        task_id: String,
        status: TaskStatus,
        updated_at: String,
        updated_by: String,
    },
}

impl ServerMessage {
    pub fn ack_ok(request_id: impl Into<String>) -> Self {
        ServerMessage::Ack {
            request_id: request_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn ack_err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        ServerMessage::Ack {
            request_id: request_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}
