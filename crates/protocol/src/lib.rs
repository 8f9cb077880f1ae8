//! taskroom Protocol
//!
//! Shared types for communication between the taskroom server and clients.
//! These types are serialized as JSON text frames over WebSocket.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

const PROJECT_ROOM_PREFIX: &str = "project:";

/// Room key for a project's broadcast group.
pub fn project_room(project_id: &str) -> String {
    format!("{PROJECT_ROOM_PREFIX}{project_id}")
}

/// Inverse of [`project_room`].
pub fn project_of_room(room: &str) -> Option<&str> {
    room.strip_prefix(PROJECT_ROOM_PREFIX)
}
