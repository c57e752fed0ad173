//! services/api/src/web/registry.rs
//!
//! Tracks the live connections of every user. A user can have several at once
//! (desktop, phone, a couple of browser tabs), and every one of them must hear
//! about changes to that user's timers.

use crate::web::protocol::ServerMessage;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// The sender half of a connection's outbound queue. The connection's writer
/// task drains the receiver into the socket.
pub type ConnectionSender = mpsc::UnboundedSender<ServerMessage>;

/// Handle used to push messages to one connected client.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub tx: ConnectionSender,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh id, returning the receiver to drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// Queues `message` without waiting. Fails once the connection is gone.
    pub fn send(&self, message: ServerMessage) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        self.tx.send(message)
    }
}

/// owner id -> live connections. Process-local, never persisted.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Vec<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner_id: Uuid, connection: ConnectionHandle) {
        debug!(%owner_id, connection_id = %connection.id, "Registering connection");
        let mut bucket = self.connections.entry(owner_id).or_default();
        if !bucket.iter().any(|c| c.id == connection.id) {
            bucket.push(connection);
        }
    }

    /// Removes a connection. Removing one that is already gone is a no-op.
    pub fn unregister(&self, owner_id: Uuid, connection_id: Uuid) {
        let emptied = match self.connections.get_mut(&owner_id) {
            Some(mut bucket) => {
                bucket.retain(|c| c.id != connection_id);
                bucket.is_empty()
            }
            None => false,
        };
        if emptied {
            self.connections
                .remove_if(&owner_id, |_, bucket| bucket.is_empty());
        }
        debug!(%owner_id, %connection_id, "Unregistered connection");
    }

    /// A snapshot of the owner's connections. Empty if there are none.
    pub fn connections_of(&self, owner_id: Uuid) -> Vec<ConnectionHandle> {
        self.connections
            .get(&owner_id)
            .map(|bucket| bucket.clone())
            .unwrap_or_default()
    }

    pub fn connection_count(&self, owner_id: Uuid) -> usize {
        self.connections
            .get(&owner_id)
            .map(|bucket| bucket.len())
            .unwrap_or(0)
    }

    /// Number of users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_and_unregister_are_per_user() {
        let registry = ConnectionRegistry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (laptop, _rx1) = ConnectionHandle::channel();
        let (phone, _rx2) = ConnectionHandle::channel();
        let (bobs, _rx3) = ConnectionHandle::channel();

        registry.register(alice, laptop.clone());
        registry.register(alice, phone.clone());
        registry.register(alice, phone.clone());
        registry.register(bob, bobs.clone());

        assert_eq!(registry.connection_count(alice), 2);
        assert_eq!(registry.connection_count(bob), 1);

        registry.unregister(alice, laptop.id);
        registry.unregister(alice, laptop.id);
        let remaining: Vec<_> = registry.connections_of(alice).iter().map(|c| c.id).collect();
        assert_eq!(remaining, vec![phone.id]);

        registry.unregister(alice, phone.id);
        assert!(registry.connections_of(alice).is_empty());
        assert_eq!(registry.user_count(), 1);

        // Unknown user: no-op.
        registry.unregister(Uuid::new_v4(), bobs.id);
        assert_eq!(registry.connection_count(bob), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_keeps_every_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let owner = Uuid::new_v4();

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let (handle, rx) = ConnectionHandle::channel();
                    registry.register(owner, handle.clone());
                    let _ = registry.connections_of(owner);
                    if i % 2 == 0 {
                        registry.unregister(owner, handle.id);
                    }
                    rx
                })
            })
            .collect();

        let mut receivers = Vec::new();
        for task in tasks {
            receivers.push(task.await.unwrap());
        }
        assert_eq!(registry.connection_count(owner), 16);
    }
}
