//! Live connection tracking and broadcast fan-out.
//!
//! The manager holds the set of admitted connections in process memory.
//! Broadcasts work on a point-in-time snapshot of the set, so concurrent
//! admits and removals during iteration are tolerated; a delivery failure
//! on one connection never aborts delivery to the rest.

use crate::identity::Identity;
use bytes::Bytes;
use dashmap::DashMap;
use pylon_protocol::{codec, Reply};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

/// Counter disambiguating ids generated within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_nanos() as u64;
        let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{counter:x}", timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A live connection record: created on admission, destroyed on every exit
/// path.
struct ConnectionHandle {
    identity: Identity,
    sender: mpsc::UnboundedSender<Bytes>,
}

/// Result of a broadcast attempt.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Connections the message was delivered to.
    pub delivered: usize,
    /// Connections whose delivery failed; they have been removed.
    pub failed: Vec<ConnectionId>,
}

/// Tracks admitted connections and fans out unsolicited messages.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register an admitted connection with its outbound channel.
    pub fn register(
        &self,
        id: ConnectionId,
        identity: Identity,
        sender: mpsc::UnboundedSender<Bytes>,
    ) {
        debug!(connection = %id, principal = %identity.principal, "Connection registered");
        self.connections.insert(id, ConnectionHandle { identity, sender });
    }

    /// Remove a connection. Idempotent.
    pub fn remove(&self, id: &ConnectionId) {
        if self.connections.remove(id).is_some() {
            debug!(connection = %id, "Connection removed");
        }
    }

    /// Principal of a live connection, if any.
    #[must_use]
    pub fn principal_of(&self, id: &ConnectionId) -> Option<String> {
        self.connections
            .get(id)
            .map(|handle| handle.identity.principal.clone())
    }

    /// Send an unsolicited message to one connection.
    ///
    /// Returns `false` if the connection is unknown or its channel is
    /// closed; a closed connection is removed.
    pub fn send_to(&self, id: &ConnectionId, reply: &Reply) -> bool {
        let Ok(payload) = codec::encode(reply) else {
            warn!(connection = %id, "Failed to encode push message");
            return false;
        };

        let delivered = self
            .connections
            .get(id)
            .is_some_and(|handle| handle.sender.send(payload).is_ok());

        if !delivered && self.connections.contains_key(id) {
            self.remove(id);
        }
        delivered
    }

    /// Broadcast a message to every live connection.
    ///
    /// Delivery failures are isolated per recipient: the failing connection
    /// is removed (closing its outbound channel) and fan-out continues. No
    /// error escapes this method.
    pub fn broadcast(&self, reply: &Reply) -> BroadcastReport {
        let payload = match codec::encode(reply) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "Failed to encode broadcast message");
                return BroadcastReport::default();
            }
        };

        // Point-in-time snapshot so concurrent admits/removals during
        // iteration cannot corrupt the fan-out.
        let targets: Vec<(ConnectionId, mpsc::UnboundedSender<Bytes>)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().sender.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, sender) in targets {
            if sender.send(payload.clone()).is_ok() {
                report.delivered += 1;
            } else {
                warn!(connection = %id, "Broadcast delivery failed, removing connection");
                self.remove(&id);
                report.failed.push(id);
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed.len(),
            "Broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity::new("u1", std::iter::empty())
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[tokio::test]
    async fn test_register_remove() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = ConnectionId::from("c1");
        manager.register(id.clone(), identity(), tx);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.principal_of(&id).as_deref(), Some("u1"));

        manager.remove(&id);
        manager.remove(&id); // idempotent
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let manager = ConnectionManager::new();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();

        manager.register(ConnectionId::from("a"), identity(), tx_a);
        manager.register(ConnectionId::from("b"), identity(), tx_b);
        manager.register(ConnectionId::from("c"), identity(), tx_c);

        // Simulate a dead connection: its receiver is gone.
        drop(rx_b);

        let report = manager.broadcast(&Reply::push(9, json!({"event": "tick"})));

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![ConnectionId::from("b")]);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());

        // The failing connection was removed from the set.
        assert_eq!(manager.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection() {
        let manager = ConnectionManager::new();
        assert!(!manager.send_to(&ConnectionId::from("nope"), &Reply::push(1, json!({}))));
    }

    #[tokio::test]
    async fn test_send_to_delivers() {
        let manager = ConnectionManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ConnectionId::from("c1");
        manager.register(id.clone(), identity(), tx);

        assert!(manager.send_to(&id, &Reply::push(9, json!({"n": 1}))));
        assert!(rx.recv().await.is_some());
    }
}
