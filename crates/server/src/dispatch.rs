//! Room fan-out and direct delivery.
//!
//! Delivery is best-effort: frames go onto each connection's bounded
//! outbound queue and the writer task owns the socket. A full or closed
//! queue drops the frame for that connection only. Direct sends wait for
//! queue space, but never longer than the dispatcher's direct timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use taskroom_protocol::ServerMessage;

use crate::rooms::{ConnectionId, RoomRegistry};

/// Frames queued for a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Serialized by the writer
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// How long a direct send may wait on a full queue before the connection
/// is treated as stalled.
pub const DIRECT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Cheap to Clone.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
    direct_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self::with_direct_timeout(registry, DIRECT_SEND_TIMEOUT)
    }

    pub fn with_direct_timeout(registry: Arc<RoomRegistry>, direct_timeout: Duration) -> Self {
        Self {
            registry,
            direct_timeout,
        }
    }

    /// Deliver to every current member of `room`. Returns how many queues
    /// accepted the frame.
    pub fn broadcast(&self, room: &str, msg: ServerMessage) -> usize {
        self.fan_out(room, msg, None)
    }

    /// Deliver to every member of `room` except `skip`.
    pub fn broadcast_except(&self, room: &str, msg: ServerMessage, skip: ConnectionId) -> usize {
        self.fan_out(room, msg, Some(skip))
    }

    /// Deliver to one connection, waiting for queue space up to the direct
    /// timeout. Returns false if the connection is gone or stalled.
    pub async fn send_to(&self, id: ConnectionId, msg: ServerMessage) -> bool {
        let Some(tx) = self.registry.outbound(id) else {
            debug!(
                component = "dispatch",
                event = "dispatch.direct.no_connection",
                connection_id = id,
                "Connection no longer registered, direct message dropped"
            );
            return false;
        };
        match tokio::time::timeout(self.direct_timeout, tx.send(Outbound::Json(msg))).await {
            Ok(sent) => sent.is_ok(),
            Err(_) => {
                warn!(
                    component = "dispatch",
                    event = "dispatch.direct.stalled",
                    connection_id = id,
                    timeout_ms = self.direct_timeout.as_millis() as u64,
                    "Outbound queue stayed full, direct message dropped"
                );
                false
            }
        }
    }

    fn fan_out(&self, room: &str, msg: ServerMessage, skip: Option<ConnectionId>) -> usize {
        // Resolve senders first so no registry guard is held while queuing.
        let recipients: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = self
            .registry
            .members_of(room)
            .into_iter()
            .filter(|id| Some(*id) != skip)
            .filter_map(|id| self.registry.outbound(id).map(|tx| (id, tx)))
            .collect();

        let mut delivered = 0;
        for (id, tx) in recipients {
            match tx.try_send(Outbound::Json(msg.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        component = "dispatch",
                        event = "dispatch.broadcast.queue_full",
                        connection_id = id,
                        room = %room,
                        "Outbound queue full, broadcast dropped for connection"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        component = "dispatch",
                        event = "dispatch.broadcast.closed",
                        connection_id = id,
                        room = %room,
                        "Connection closing, broadcast dropped"
                    );
                }
            }
        }
        delivered
    }
}
