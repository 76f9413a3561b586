//! Presence registry.
//!
//! Maps logical user ids to the connection that most recently identified as
//! them, and keeps the outbound channel of every open connection so presence
//! changes can be broadcast to all of them.
//!
//! The registry is an explicit service object: `main` builds one per server,
//! hands it to the router state and drops it at shutdown. Tests build as many
//! isolated instances as they like.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Identifier of a single WebSocket connection.
pub type ConnectionId = Uuid;

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Outcome of [`PresenceRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registration {
    /// Another connection that was mapped to the same user id and has now
    /// lost the mapping. It is left open.
    pub displaced: Option<ConnectionId>,
    /// The identity this connection held before re-identifying, if different.
    pub previous_identity: Option<String>,
}

#[derive(Default)]
struct PresenceTable {
    /// user id → connection. Sorted so every broadcast lists users in a
    /// stable order.
    by_user: BTreeMap<String, ConnectionId>,
    /// connection → user id, the reverse of `by_user`.
    by_connection: HashMap<ConnectionId, String>,
}

/// Shared presence registry.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    /// Every open connection, identified or not.
    connections: Arc<DashMap<ConnectionId, ClientSender>>,
    /// Identity table. Mutations and the broadcast that follows them happen
    /// under one lock so clients never observe presence lists out of order.
    table: Arc<Mutex<PresenceTable>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connections ───────────────────────────────────────────────────────

    /// Track a newly opened connection and return its id.
    pub fn connect(&self, sender: ClientSender) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        self.connections.insert(connection_id, sender);
        tracing::debug!(connection_id = %connection_id, "Connection opened");
        connection_id
    }

    /// Forget a closed connection, dropping any identity it held.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections.remove(&connection_id);
        let user_id = self.unregister(connection_id);
        tracing::debug!(
            connection_id = %connection_id,
            user_id = user_id.as_deref().unwrap_or("-"),
            "Connection closed"
        );
        user_id
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Identity ──────────────────────────────────────────────────────────

    /// Map `user_id` to `connection_id`, then broadcast the online list.
    ///
    /// Last registration wins: if another connection held `user_id` it loses
    /// the mapping but stays open. If this connection previously identified as
    /// someone else, that entry is removed.
    pub fn register(&self, connection_id: ConnectionId, user_id: &str) -> Registration {
        let mut table = self.table.lock();
        let mut registration = Registration::default();

        if let Some(previous) = table.by_connection.remove(&connection_id) {
            if previous != user_id {
                table.by_user.remove(&previous);
                registration.previous_identity = Some(previous);
            }
        }

        if let Some(old) = table.by_user.insert(user_id.to_string(), connection_id) {
            if old != connection_id {
                table.by_connection.remove(&old);
                registration.displaced = Some(old);
            }
        }
        table.by_connection.insert(connection_id, user_id.to_string());

        if let Some(displaced) = registration.displaced {
            tracing::warn!(
                user_id = user_id,
                connection_id = %connection_id,
                displaced = %displaced,
                "Identity taken over by a newer connection"
            );
        }
        tracing::info!(user_id = user_id, connection_id = %connection_id, "User identified");

        self.broadcast_locked(&table);
        registration
    }

    /// Remove the entry held by `connection_id`, if any, then broadcast the
    /// online list. Returns the user id that went offline.
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<String> {
        let mut table = self.table.lock();
        let user_id = table.by_connection.remove(&connection_id);
        if let Some(ref uid) = user_id {
            table.by_user.remove(uid);
            tracing::info!(user_id = uid.as_str(), "User went offline");
        }
        self.broadcast_locked(&table);
        user_id
    }

    /// Connection currently registered for `user_id`.
    pub fn resolve(&self, user_id: &str) -> Option<ConnectionId> {
        self.table.lock().by_user.get(user_id).copied()
    }

    /// User id registered by `connection_id`.
    pub fn identity_of(&self, connection_id: ConnectionId) -> Option<String> {
        self.table.lock().by_connection.get(&connection_id).cloned()
    }

    /// All registered user ids, sorted.
    pub fn online_users(&self) -> Vec<String> {
        self.table.lock().by_user.keys().cloned().collect()
    }

    /// Number of registered user ids.
    pub fn online_count(&self) -> usize {
        self.table.lock().by_user.len()
    }

    // ── Delivery ──────────────────────────────────────────────────────────

    /// Queue a message on a connection. Returns false if it is gone.
    pub fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        match self.connections.get(&connection_id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Queue a message for whichever connection holds `user_id`.
    pub fn send_to_user(&self, user_id: &str, message: ServerMessage) -> bool {
        match self.resolve(user_id) {
            Some(connection_id) => self.send_to(connection_id, message),
            None => false,
        }
    }

    fn broadcast_locked(&self, table: &PresenceTable) {
        let users: Vec<String> = table.by_user.keys().cloned().collect();
        for entry in self.connections.iter() {
            let _ = entry.value().send(ServerMessage::OnlineList(users.clone()));
        }
    }
}
