//! One authenticated WebSocket connection.
//!
//! A session only exists after the handshake succeeded, so it starts
//! authenticated with no rooms. Inbound events are handled one at a time in
//! arrival order; the ack for an event is queued before the next event is
//! read. Teardown runs exactly once, from `close()`, from a reply the
//! connection could not take in time, or from `Drop` if the owning task is
//! cancelled or panics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use taskroom_protocol::{project_of_room, project_room, ClientMessage, ServerMessage, TaskStatus};

use crate::clock;
use crate::dispatch::{Dispatcher, Outbound};
use crate::error::{EventError, GatewayError};
use crate::persistence::{Store, StoredMessage, StoredTask};
use crate::rooms::{ConnectionId, RoomRegistry};

/// How many answered request ids a session remembers for replay.
const ACK_LEDGER_CAPACITY: usize = 128;

/// Lifecycle as observed from outside the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake passed, no rooms joined.
    Idle,
    /// Handshake passed, member of these rooms (sorted).
    InRooms(Vec<String>),
    Disconnected,
}

/// Event kind plus client request id. Ids are only unique per kind.
type AckKey = (&'static str, String);

/// Recently sent acks, oldest evicted first.
struct AckLedger {
    order: VecDeque<AckKey>,
    acks: HashMap<AckKey, ServerMessage>,
    capacity: usize,
}

impl AckLedger {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            acks: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    fn replay(&self, kind: &'static str, request_id: &str) -> Option<ServerMessage> {
        self.acks.get(&(kind, request_id.to_string())).cloned()
    }

    fn record(&mut self, kind: &'static str, request_id: String, ack: ServerMessage) {
        let key = (kind, request_id);
        if self.acks.insert(key.clone(), ack).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.acks.remove(&oldest);
            }
        }
    }
}

pub struct ConnectionSession {
    id: ConnectionId,
    user_id: String,
    registry: Arc<RoomRegistry>,
    dispatcher: Dispatcher,
    store: Store,
    acks: AckLedger,
    closed: AtomicBool,
}

impl ConnectionSession {
    /// Register an authenticated connection. `outbound` feeds its writer task.
    pub fn open(
        id: ConnectionId,
        user_id: String,
        outbound: mpsc::Sender<Outbound>,
        registry: Arc<RoomRegistry>,
        store: Store,
    ) -> Self {
        registry.register(id, user_id.clone(), outbound);
        info!(
            component = "session",
            event = "session.opened",
            connection_id = id,
            user_id = %user_id,
            "Session authenticated"
        );

        Self {
            id,
            dispatcher: Dispatcher::new(Arc::clone(&registry)),
            user_id,
            registry,
            store,
            acks: AckLedger::new(ACK_LEDGER_CAPACITY),
            closed: AtomicBool::new(false),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[cfg(test)]
    fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.dispatcher = Dispatcher::with_direct_timeout(Arc::clone(&self.registry), timeout);
        self
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            return ConnectionState::Disconnected;
        }
        let rooms = self.registry.rooms_of(self.id);
        if rooms.is_empty() {
            ConnectionState::Idle
        } else {
            ConnectionState::InRooms(rooms)
        }
    }

    /// Handle one inbound event. Never fails: errors are reported to this
    /// connection as `error` events or failed acks.
    pub async fn handle(&mut self, msg: ClientMessage) {
        if self.is_closed() {
            return;
        }
        let kind = msg.kind();
        debug!(
            component = "session",
            event = "session.event.received",
            connection_id = self.id,
            kind = kind,
            "Handling client event"
        );

        match msg {
            ClientMessage::JoinRoom { project_id } => self.join_room(project_id).await,
            ClientMessage::LeaveRoom { project_id } => self.leave_room(project_id),
            ClientMessage::SendMessage {
                request_id,
                project_id,
                content,
            } => {
                if self.replay_ack(kind, &request_id).await {
                    return;
                }
                let outcome = self.send_message(project_id, content).await;
                self.ack_then_broadcast(kind, request_id, "Failed to send message", outcome)
                    .await;
            }
            ClientMessage::UpdateTaskStatus {
                request_id,
                task_id,
                status,
            } => {
                if self.replay_ack(kind, &request_id).await {
                    return;
                }
                let outcome = self.update_task_status(task_id, status).await;
                self.ack_then_broadcast(kind, request_id, "Failed to update task status", outcome)
                    .await;
            }
        }
    }

    /// Report a frame that could not be parsed as an event.
    pub async fn reject_frame(&self, reason: &str) {
        self.reply(ServerMessage::Error {
            message: format!("Invalid event: {reason}"),
        })
        .await;
    }

    /// Leave every room and detach from the registry. Later events are
    /// ignored; calling it again is a no-op.
    pub fn close(&self) {
        self.teardown();
    }

    /// True once teardown ran. The transport stops reading at that point.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn join_room(&self, project_id: String) {
        match self.store.find_project_access(&project_id, &self.user_id).await {
            Ok(project) => {
                let room = project_room(&project.id);
                if !self.registry.join(&room, self.id) {
                    return;
                }
                info!(
                    component = "session",
                    event = "room.joined",
                    connection_id = self.id,
                    user_id = %self.user_id,
                    project_id = %project.id,
                    "Joined project room"
                );
                self.dispatcher.broadcast_except(
                    &room,
                    ServerMessage::PeerJoined {
                        user_id: self.user_id.clone(),
                        project_id,
                        timestamp: clock::now_rfc3339(),
                    },
                    self.id,
                );
            }
            Err(e) => {
                let message = match &e {
                    GatewayError::AuthorizationDenied | GatewayError::NotFound(_) => {
                        warn!(
                            component = "session",
                            event = "room.join_denied",
                            connection_id = self.id,
                            user_id = %self.user_id,
                            project_id = %project_id,
                            "Join refused"
                        );
                        "Access denied"
                    }
                    _ => {
                        error!(
                            component = "session",
                            event = "room.join_failed",
                            connection_id = self.id,
                            project_id = %project_id,
                            error = %e,
                            "Error joining project room"
                        );
                        "Failed to join project"
                    }
                };
                self.reply(ServerMessage::Error {
                    message: message.to_string(),
                })
                .await;
            }
        }
    }

    fn leave_room(&self, project_id: String) {
        let room = project_room(&project_id);
        if !self.registry.leave(&room, self.id) {
            return;
        }
        info!(
            component = "session",
            event = "room.left",
            connection_id = self.id,
            user_id = %self.user_id,
            project_id = %project_id,
            "Left project room"
        );
        self.dispatcher.broadcast(
            &room,
            ServerMessage::PeerLeft {
                user_id: self.user_id.clone(),
                project_id,
                timestamp: clock::now_rfc3339(),
            },
        );
    }

    /// Re-send the stored ack for an already answered request id. Returns
    /// true if the request was a duplicate.
    async fn replay_ack(&self, kind: &'static str, request_id: &str) -> bool {
        let Some(ack) = self.acks.replay(kind, request_id) else {
            return false;
        };
        debug!(
            component = "session",
            event = "session.ack.replayed",
            connection_id = self.id,
            request_id = %request_id,
            "Duplicate request id, replaying ack"
        );
        self.reply(ack).await;
        true
    }

    /// Ack the outcome to this connection, then broadcast on success. The
    /// ack is always queued before the broadcast, and the broadcast goes out
    /// even if the ack could not be delivered.
    async fn ack_then_broadcast(
        &mut self,
        kind: &'static str,
        request_id: String,
        fallback: &str,
        outcome: Result<Broadcast, EventError>,
    ) {
        let ack = match &outcome {
            Ok(_) => ServerMessage::ack_ok(&request_id),
            Err(e) => {
                if matches!(e, EventError::Gateway(g) if g.is_unexpected()) {
                    error!(
                        component = "session",
                        event = "session.event.failed",
                        connection_id = self.id,
                        request_id = %request_id,
                        error = %e,
                        "Event failed"
                    );
                } else {
                    debug!(
                        component = "session",
                        event = "session.event.rejected",
                        connection_id = self.id,
                        request_id = %request_id,
                        reason = %e,
                        "Event rejected"
                    );
                }
                ServerMessage::ack_err(&request_id, e.client_message(fallback))
            }
        };
        self.acks.record(kind, request_id, ack.clone());
        self.reply(ack).await;

        if let Ok(broadcast) = outcome {
            self.dispatcher.broadcast(&broadcast.room, broadcast.message);
        }
    }

    async fn send_message(
        &self,
        project_id: String,
        content: String,
    ) -> Result<Broadcast, EventError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EventError::Validation("Message content is required"));
        }

        let message = self
            .store
            .create_message_if_authorized(&self.user_id, &project_id, content)
            .await?;
        info!(
            component = "session",
            event = "message.persisted",
            connection_id = self.id,
            user_id = %self.user_id,
            project_id = %message.project_id,
            message_id = %message.id,
            "Message sent"
        );
        Ok(Broadcast::new_message(message))
    }

    async fn update_task_status(
        &self,
        task_id: String,
        status: String,
    ) -> Result<Broadcast, EventError> {
        let status = TaskStatus::parse(&status).ok_or(EventError::Validation("Invalid status"))?;

        let task = self
            .store
            .update_task_status_if_authorized(&self.user_id, &task_id, status)
            .await?;
        info!(
            component = "session",
            event = "task.status_updated",
            connection_id = self.id,
            user_id = %self.user_id,
            task_id = %task.id,
            status = %task.status,
            "Task status updated"
        );
        Ok(Broadcast::task_updated(task))
    }

    /// Direct delivery to this connection. A connection that cannot take its
    /// own reply in time is dead to us and gets torn down.
    async fn reply(&self, msg: ServerMessage) {
        if self.dispatcher.send_to(self.id, msg).await {
            return;
        }
        if !self.is_closed() {
            warn!(
                component = "session",
                event = "session.reply.undeliverable",
                connection_id = self.id,
                user_id = %self.user_id,
                "Reply could not be delivered, closing session"
            );
        }
        self.teardown();
    }

    fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
        let Some(departure) = self.registry.unregister(self.id) else {
            return;
        };

        let timestamp = clock::now_rfc3339();
        for room in &departure.rooms {
            let project_id = project_of_room(room).unwrap_or(room.as_str()).to_string();
            self.dispatcher.broadcast(
                room,
                ServerMessage::PeerLeft {
                    user_id: departure.user_id.clone(),
                    project_id,
                    timestamp: timestamp.clone(),
                },
            );
        }

        info!(
            component = "session",
            event = "session.closed",
            connection_id = self.id,
            user_id = %departure.user_id,
            rooms = departure.rooms.len(),
            "Session torn down"
        );
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// A room broadcast produced by a successful event.
struct Broadcast {
    room: String,
    message: ServerMessage,
}

impl Broadcast {
    fn new_message(message: StoredMessage) -> Self {
        Self {
            room: project_room(&message.project_id),
            message: ServerMessage::NewMessage {
                id: message.id,
                content: message.content,
                sender: message.sender,
                project_id: message.project_id,
                created_at: message.created_at,
            },
        }
    }

    fn task_updated(task: StoredTask) -> Self {
        Self {
            room: project_room(&task.project_id),
            message: ServerMessage::TaskUpdated {
                task_id: task.id,
                status: task.status,
                updated_at: task.updated_at,
                updated_by: task.updated_by,
            },
        }
    }
}
