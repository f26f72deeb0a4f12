use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use devlease_protocol::ServerEvent;

use crate::principal::Principal;

pub type SessionId = Uuid;

/// Handle for one live connection: its id and the principal fixed at handshake.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    principal: Arc<Principal>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

struct SessionEntry {
    principal: Arc<Principal>,
    sender: mpsc::Sender<ServerEvent>,
}

/// Registry of live sessions and dumb fan-out of server events.
///
/// Delivery never waits on a slow reader: if a session's queue is full the
/// event is dropped for that session only.
pub struct RealtimeBroker {
    sessions: DashMap<SessionId, SessionEntry>,
    queue_capacity: usize,
}

impl RealtimeBroker {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a connection. The receiver yields everything addressed to it.
    pub fn connect(&self, principal: Principal) -> (Session, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let principal = Arc::new(principal);
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            SessionEntry {
                principal: principal.clone(),
                sender,
            },
        );
        debug!(session = %id, tier = ?principal.tier(), "session connected");
        (Session { id, principal }, receiver)
    }

    /// Drop a session; its receiver ends once queued events are drained.
    pub fn disconnect(&self, id: SessionId) {
        if let Some((_, entry)) = self.sessions.remove(&id) {
            debug!(session = %id, user = %entry.principal.display_name(), "session disconnected");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver to every live session. Returns how many accepted the event.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            if deliver(*entry.key(), &entry.value().sender, event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver to exactly one session. Returns false if it is gone or lagging.
    pub fn unicast(&self, id: SessionId, event: ServerEvent) -> bool {
        // Clone the sender so the map shard is not held during delivery.
        let Some(sender) = self.sessions.get(&id).map(|e| e.value().sender.clone()) else {
            debug!(session = %id, "unicast to departed session dropped");
            return false;
        };
        deliver(id, &sender, event)
    }
}

impl Default for RealtimeBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

fn deliver(id: SessionId, sender: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    match sender.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(session = %id, "session queue full, event dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
