//! Application state

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::IdentityPolicy;
use crate::persistence::Store;
use crate::rooms::{ConnectionId, RoomRegistry};

/// Shared per-server state, handed to axum handlers as `Arc<AppState>`.
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub store: Store,
    pub identity: IdentityPolicy,
    /// Close connections that stay silent this long. `None` disables.
    pub idle_timeout: Option<Duration>,
    pub started_at: Instant,
    next_connection_id: AtomicU64,
}

impl AppState {
    pub fn new(store: Store, identity: IdentityPolicy, idle_timeout: Option<Duration>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new()),
            store,
            identity,
            idle_timeout,
            started_at: Instant::now(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}
