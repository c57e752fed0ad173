//! services/api/src/web/broadcaster.rs
//!
//! Pushes timer changes to every live connection of the owning user.
//!
//! Delivery is fire-and-forget: each send only enqueues onto the connection's
//! outbound channel. A send that fails means the connection's writer is gone, so
//! the handle is dropped from the registry. There are no acknowledgements or
//! retries; a client that missed something recovers with the next sync.
//!
//! Store writes are serialized per timer, but the fan-out happens after the
//! store releases its lock. `timer.updated` for one timer therefore goes out
//! in `updated_at` order: an update older than the last one sent is dropped,
//! since every connection already holds the newer state.

use crate::web::{
    protocol::{ServerMessage, TimerView},
    registry::ConnectionRegistry,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use timer_core::domain::TimerSession;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SyncBroadcaster {
    registry: Arc<ConnectionRegistry>,
    /// `updated_at` of the last `timer.updated` sent per timer.
    last_sent: Arc<DashMap<Uuid, DateTime<Utc>>>,
}

impl SyncBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            last_sent: Arc::new(DashMap::new()),
        }
    }

    /// Sends `timer.updated` for one timer. Returns the number of connections
    /// reached, which is 0 when a newer version of the timer was already sent.
    pub fn broadcast_timer(&self, owner_id: Uuid, timer: &TimerSession) -> usize {
        // The entry stays locked through the fan-out.
        let mut last = self.last_sent.entry(timer.id).or_insert(timer.updated_at);
        if timer.updated_at < *last {
            debug!(%owner_id, timer_id = %timer.id, "Skipping stale timer update");
            return 0;
        }
        *last = timer.updated_at;
        self.broadcast(owner_id, ServerMessage::TimerUpdated(TimerView::from(timer)))
    }

    /// Sends a `timer.sync_result` snapshot.
    pub fn broadcast_sync(&self, owner_id: Uuid, timers: &[TimerSession]) -> usize {
        self.broadcast(owner_id, ServerMessage::sync_result(timers))
    }

    pub fn broadcast_deleted(&self, owner_id: Uuid, timer_id: Uuid) -> usize {
        self.last_sent.remove(&timer_id);
        self.broadcast(owner_id, ServerMessage::TimerDeleted { timer_id })
    }

    pub fn broadcast(&self, owner_id: Uuid, message: ServerMessage) -> usize {
        let kind = message.kind();
        let mut delivered = 0;
        for connection in self.registry.connections_of(owner_id) {
            match connection.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(%owner_id, connection_id = %connection.id, "Dropping dead connection");
                    self.registry.unregister(owner_id, connection.id);
                }
            }
        }
        debug!(%owner_id, kind, delivered, "Broadcast sent");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::registry::ConnectionHandle;
    use chrono::{Duration, TimeZone};
    use timer_core::domain::TimerDraft;
    use timer_core::state;

    fn timer(owner: Uuid) -> TimerSession {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let draft = TimerDraft {
            allocated_duration: 1500,
            ..Default::default()
        };
        state::start(&state::create(owner, draft, now).unwrap(), now).unwrap()
    }

    #[test]
    fn reaches_every_connection_of_the_owner_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = SyncBroadcaster::new(registry.clone());
        let owner = Uuid::new_v4();
        let (a, mut rx_a) = ConnectionHandle::channel();
        let (b, mut rx_b) = ConnectionHandle::channel();
        let (other, mut rx_other) = ConnectionHandle::channel();
        registry.register(owner, a);
        registry.register(owner, b);
        registry.register(Uuid::new_v4(), other);

        let timer = timer(owner);
        assert_eq!(broadcaster.broadcast_timer(owner, &timer), 2);

        let expected = ServerMessage::TimerUpdated(TimerView::from(&timer));
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert_eq!(rx_b.try_recv().unwrap(), expected);
        assert!(rx_other.try_recv().is_err());
    }

    #[test]
    fn dead_connection_is_pruned_without_blocking_others() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = SyncBroadcaster::new(registry.clone());
        let owner = Uuid::new_v4();
        let (dead, dead_rx) = ConnectionHandle::channel();
        let (alive, mut alive_rx) = ConnectionHandle::channel();
        registry.register(owner, dead.clone());
        registry.register(owner, alive.clone());
        drop(dead_rx);

        let timers = vec![timer(owner)];
        assert_eq!(broadcaster.broadcast_sync(owner, &timers), 1);

        match alive_rx.try_recv().unwrap() {
            ServerMessage::SyncResult { count, timers } => {
                assert_eq!(count, 1);
                assert_eq!(timers[0].status, "RUNNING");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        let ids: Vec<_> = registry.connections_of(owner).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![alive.id]);
    }

    #[test]
    fn older_update_after_newer_one_is_not_sent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = SyncBroadcaster::new(registry.clone());
        let owner = Uuid::new_v4();
        let (watcher, mut rx) = ConnectionHandle::channel();
        registry.register(owner, watcher);

        let running = timer(owner);
        let paused = state::pause(&running, running.updated_at + Duration::seconds(10)).unwrap();
        let resumed = state::resume(&paused, paused.updated_at + Duration::seconds(5)).unwrap();

        // The resume committed last but its fan-out overtook the pause.
        assert_eq!(broadcaster.broadcast_timer(owner, &resumed), 1);
        assert_eq!(broadcaster.broadcast_timer(owner, &paused), 0);

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::TimerUpdated(TimerView::from(&resumed))
        );
        assert!(rx.try_recv().is_err());

        // Same-instant writes are still delivered.
        assert_eq!(broadcaster.broadcast_timer(owner, &resumed), 1);
        broadcaster.broadcast_deleted(owner, resumed.id);
        assert_eq!(broadcaster.broadcast_timer(owner, &paused), 1);
    }

    #[test]
    fn no_connections_is_not_an_error() {
        let broadcaster = SyncBroadcaster::new(Arc::new(ConnectionRegistry::new()));
        assert_eq!(broadcaster.broadcast_deleted(Uuid::new_v4(), Uuid::new_v4()), 0);
    }
}
