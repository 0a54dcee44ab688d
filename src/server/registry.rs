//! Presence registry: user identity → live connection.
//!
//! An injected instance owned by the connection-lifecycle component.
//! Exactly one connection per identity: a new registration supersedes
//! the old one, and removal is guarded by a connection id so a
//! superseded socket closing late cannot knock the new one out.

use crate::protocol::SignalingEvent;
use crate::types::user::UserId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub user: UserId,
    pub sender: mpsc::Sender<SignalingEvent>,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Best-effort delivery to this connection's write task. A full
    /// channel means the client is not draining; the event is dropped
    /// rather than blocking the caller.
    pub fn push(&self, event: SignalingEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    target: "Server/Registry",
                    "Dropping event for {}: {e}", self.user
                );
                false
            }
        }
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
    last_seen: DashMap<UserId, DateTime<Utc>>,
    conn_counter: AtomicU64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `user` to a live connection, superseding any previous one.
    /// Returns the connection id used to guard removal.
    pub fn register(&self, user: UserId, sender: mpsc::Sender<SignalingEvent>) -> u64 {
        let conn_id = self.conn_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ConnectionHandle {
            conn_id,
            user: user.clone(),
            sender,
            connected_at: Utc::now(),
        };
        if let Some(old) = self.connections.insert(user.clone(), handle) {
            debug!(
                target: "Server/Registry",
                "Superseding connection {} for {user}", old.conn_id
            );
        }
        conn_id
    }

    /// Unbinds `user` if the stored connection is still `conn_id`, and
    /// records the last-seen timestamp. Returns whether a removal
    /// happened.
    pub fn remove(&self, user: &UserId, conn_id: u64) -> bool {
        let removed = self
            .connections
            .remove_if(user, |_, handle| handle.conn_id == conn_id)
            .is_some();
        if removed {
            self.last_seen.insert(user.clone(), Utc::now());
        }
        removed
    }

    pub fn get(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.connections.get(user).map(|h| h.clone())
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.connections.contains_key(user)
    }

    pub fn last_seen(&self, user: &UserId) -> Option<DateTime<Utc>> {
        self.last_seen.get(user).map(|t| *t)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Pushes `event` to every open connection, suppressing the echo to
    /// `except` when given.
    pub fn broadcast(&self, event: &SignalingEvent, except: Option<&UserId>) {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .filter(|e| Some(e.key()) != except)
            .map(|e| e.value().clone())
            .collect();
        for handle in handles {
            handle.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventBody;

    fn event() -> SignalingEvent {
        SignalingEvent::new(EventBody::Ping)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry.register(UserId::from("A"), tx);

        assert!(registry.is_online(&UserId::from("A")));
        assert!(!registry.is_online(&UserId::from("B")));
        assert_eq!(registry.online_users(), vec![UserId::from("A")]);
    }

    /// A new registration supersedes the old connection for the same
    /// identity.
    #[tokio::test]
    async fn test_registration_supersedes() {
        let registry = PresenceRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let first = registry.register(UserId::from("A"), tx1);
        let second = registry.register(UserId::from("A"), tx2);
        assert_ne!(first, second);

        registry.broadcast(&event(), None);
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());

        // The superseded socket closing late must not unbind the new one.
        assert!(!registry.remove(&UserId::from("A"), first));
        assert!(registry.is_online(&UserId::from("A")));
        assert!(registry.remove(&UserId::from("A"), second));
        assert!(!registry.is_online(&UserId::from("A")));
    }

    #[tokio::test]
    async fn test_remove_records_last_seen() {
        let registry = PresenceRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let conn_id = registry.register(UserId::from("A"), tx);
        assert!(registry.last_seen(&UserId::from("A")).is_none());

        registry.remove(&UserId::from("A"), conn_id);
        assert!(registry.last_seen(&UserId::from("A")).is_some());
    }

    /// Broadcast reaches everyone except the suppressed originator.
    #[tokio::test]
    async fn test_broadcast_suppresses_originator() {
        let registry = PresenceRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        registry.register(UserId::from("A"), tx_a);
        registry.register(UserId::from("B"), tx_b);

        registry.broadcast(&event(), Some(&UserId::from("A")));
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }
}
