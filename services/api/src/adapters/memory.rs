//! services/api/src/adapters/memory.rs
//!
//! A process-local implementation of the `TimerStore` port. Records live in a
//! `DashMap`; writers to the same timer id are serialized by an explicit per-id
//! async mutex held across the whole read-modify-write.
//!
//! Lock entries only exist for stored timers (plus the ones a writer is
//! momentarily holding), so requests for unknown ids leave nothing behind.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use timer_core::clock::Clock;
use timer_core::domain::{LinkedEntity, TimerSession};
use timer_core::ports::{PortError, PortResult, TimerStore, Transition};
use timer_core::state::TimerError;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct MemoryTimerStore {
    records: DashMap<Uuid, TimerSession>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Held while checking and claiming a linked entity, so two timers can't
    /// both become active for it.
    entity_claims: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl MemoryTimerStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            locks: DashMap::new(),
            entity_claims: Mutex::new(()),
            clock,
        }
    }

    fn lock_for(&self, id: Uuid) -> PortResult<Arc<Mutex<()>>> {
        if !self.records.contains_key(&id) {
            return Err(not_found(id));
        }
        Ok(self.locks.entry(id).or_default().clone())
    }

    /// Drops the lock entry of a timer that no longer exists, once no other
    /// writer holds it.
    fn release(&self, id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(&id, |_, held| {
            Arc::strong_count(held) == 1 && !self.records.contains_key(&id)
        });
    }

    async fn locked_update(
        &self,
        id: Uuid,
        owner_id: Uuid,
        transition: Transition,
    ) -> PortResult<TimerSession> {
        let current = self.owned(id, owner_id)?;
        let mut next = transition(&current)?;

        // Becoming active re-claims the linked entity.
        let _claims = match (current.is_active(), next.is_active(), next.linked_entity) {
            (false, true, Some(entity)) => {
                let claims = self.entity_claims.lock().await;
                if self.active_claim(owner_id, entity, id).is_some() {
                    return Err(TimerError::EntityBusy(entity).into());
                }
                Some(claims)
            }
            _ => None,
        };

        next.updated_at = self.clock.now();
        self.records.insert(id, next.clone());
        Ok(next)
    }

    fn owned(&self, id: Uuid, owner_id: Uuid) -> PortResult<TimerSession> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .filter(|s| s.owner_id == owner_id)
            .ok_or_else(|| not_found(id))
    }

    fn collect(&self, filter: impl Fn(&TimerSession) -> bool) -> Vec<TimerSession> {
        let mut timers: Vec<TimerSession> = self
            .records
            .iter()
            .filter(|r| filter(r.value()))
            .map(|r| r.value().clone())
            .collect();
        timers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        timers
    }

    /// Another active timer (not `except`) already tracking `entity`.
    fn active_claim(&self, owner_id: Uuid, entity: LinkedEntity, except: Uuid) -> Option<Uuid> {
        self.records
            .iter()
            .find(|r| {
                let s = r.value();
                s.id != except
                    && s.owner_id == owner_id
                    && s.linked_entity == Some(entity)
                    && s.is_active()
            })
            .map(|r| *r.key())
    }
}

fn not_found(id: Uuid) -> PortError {
    PortError::NotFound(format!("Timer {} not found", id))
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn get(&self, id: Uuid) -> PortResult<TimerSession> {
        self.records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| not_found(id))
    }

    async fn insert(&self, mut session: TimerSession) -> PortResult<TimerSession> {
        let _claims = self.entity_claims.lock().await;
        if let (true, Some(entity)) = (session.is_active(), session.linked_entity) {
            if self.active_claim(session.owner_id, entity, session.id).is_some() {
                return Err(TimerError::EntityBusy(entity).into());
            }
        }
        if self.records.contains_key(&session.id) {
            return Err(PortError::Unexpected(format!(
                "Timer {} already exists",
                session.id
            )));
        }
        session.updated_at = self.clock.now();
        self.records.insert(session.id, session.clone());
        Ok(session)
    }

    async fn save(&self, mut session: TimerSession) -> PortResult<TimerSession> {
        let id = session.id;
        let lock = self.lock_for(id)?;
        let result = {
            let _guard = lock.lock().await;
            if self.records.contains_key(&id) {
                session.updated_at = self.clock.now();
                self.records.insert(id, session.clone());
                Ok(session)
            } else {
                Err(not_found(id))
            }
        };
        self.release(id, lock);
        result
    }

    async fn update(
        &self,
        id: Uuid,
        owner_id: Uuid,
        transition: Transition,
    ) -> PortResult<TimerSession> {
        let lock = self.lock_for(id)?;
        let result = {
            let _guard = lock.lock().await;
            self.locked_update(id, owner_id, transition).await
        };
        self.release(id, lock);
        result
    }

    async fn list_active(&self, owner_id: Uuid) -> PortResult<Vec<TimerSession>> {
        Ok(self.collect(|s| s.owner_id == owner_id && s.is_active()))
    }

    async fn list_all(&self, owner_id: Uuid) -> PortResult<Vec<TimerSession>> {
        Ok(self.collect(|s| s.owner_id == owner_id))
    }

    async fn find_active_for_entity(
        &self,
        owner_id: Uuid,
        entity: LinkedEntity,
    ) -> PortResult<TimerSession> {
        self.collect(|s| s.owner_id == owner_id && s.linked_entity == Some(entity) && s.is_active())
            .into_iter()
            .next()
            .ok_or_else(|| PortError::NotFound(format!("No active timer for {:?}", entity)))
    }

    async fn delete(&self, id: Uuid, owner_id: Uuid) -> PortResult<()> {
        let lock = self.lock_for(id)?;
        let result = {
            let _guard = lock.lock().await;
            self.owned(id, owner_id).map(|_| {
                self.records.remove(&id);
            })
        };
        self.release(id, lock);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use timer_core::clock::ManualClock;
    use timer_core::domain::{TimerDraft, TimerStatus};
    use timer_core::state;

    fn store() -> (Arc<ManualClock>, MemoryTimerStore) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let store = MemoryTimerStore::new(clock.clone());
        (clock, store)
    }

    fn running(owner: Uuid, todo_id: Option<Uuid>, clock: &ManualClock) -> TimerSession {
        let draft = TimerDraft {
            allocated_duration: 600,
            todo_id,
            ..Default::default()
        };
        let created = state::create(owner, draft, clock.now()).unwrap();
        state::start(&created, clock.now()).unwrap()
    }

    #[tokio::test]
    async fn update_applies_transition_and_bumps_updated_at() {
        let (clock, store) = store();
        let owner = Uuid::new_v4();
        let timer = store.insert(running(owner, None, &clock)).await.unwrap();

        clock.advance_secs(42);
        let now = clock.now();
        let paused = store
            .update(timer.id, owner, Box::new(move |s: &TimerSession| state::pause(s, now)))
            .await
            .unwrap();

        assert_eq!(paused.status, TimerStatus::Paused);
        assert_eq!(paused.elapsed_time, 42);
        assert_eq!(paused.updated_at, clock.now());
        assert_eq!(store.get(timer.id).await.unwrap(), paused);
    }

    #[tokio::test]
    async fn foreign_owner_is_not_found_and_rejection_writes_nothing() {
        let (clock, store) = store();
        let owner = Uuid::new_v4();
        let timer = store.insert(running(owner, None, &clock)).await.unwrap();

        let now = clock.now();
        let err = store
            .update(timer.id, Uuid::new_v4(), Box::new(move |s: &TimerSession| state::pause(s, now)))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));

        let err = store
            .update(timer.id, owner, Box::new(move |s: &TimerSession| state::resume(s, now)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PortError::Rejected(TimerError::InvalidTransition { .. })
        ));
        assert_eq!(store.get(timer.id).await.unwrap(), timer);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_on_one_timer_are_serialized() {
        let (clock, store) = store();
        let store = Arc::new(store);
        let owner = Uuid::new_v4();
        let timer = store.insert(running(owner, None, &clock)).await.unwrap();
        let now = clock.now();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .update(timer.id, owner, Box::new(move |s: &TimerSession| state::pause(s, now)))
                        .await
                })
            })
            .collect();

        let mut won = 0;
        let mut lost = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => won += 1,
                Err(PortError::Rejected(TimerError::InvalidTransition { .. })) => lost += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((won, lost), (1, 7));
        assert_eq!(store.get(timer.id).await.unwrap().pause_history.len(), 2);
    }

    #[tokio::test]
    async fn one_active_timer_per_linked_entity() {
        let (clock, store) = store();
        let owner = Uuid::new_v4();
        let todo = Uuid::new_v4();
        let first = store.insert(running(owner, Some(todo), &clock)).await.unwrap();

        let err = store.insert(running(owner, Some(todo), &clock)).await.unwrap_err();
        assert!(matches!(err, PortError::Rejected(TimerError::EntityBusy(_))));

        // A not-started timer may exist, but cannot be started while the first is active.
        let idle = state::create(
            owner,
            TimerDraft {
                allocated_duration: 60,
                todo_id: Some(todo),
                ..Default::default()
            },
            clock.now(),
        )
        .unwrap();
        let idle = store.insert(idle).await.unwrap();
        let now = clock.now();
        let err = store
            .update(idle.id, owner, Box::new(move |s: &TimerSession| state::start(s, now)))
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::Rejected(TimerError::EntityBusy(_))));

        let found = store
            .find_active_for_entity(owner, LinkedEntity::Todo(todo))
            .await
            .unwrap();
        assert_eq!(found.id, first.id);

        store
            .update(first.id, owner, Box::new(move |s: &TimerSession| state::stop(s, now)))
            .await
            .unwrap();
        assert!(store
            .update(idle.id, owner, Box::new(move |s: &TimerSession| state::start(s, now)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn listing_and_delete() {
        let (clock, store) = store();
        let owner = Uuid::new_v4();
        let a = store.insert(running(owner, None, &clock)).await.unwrap();
        clock.advance_secs(1);
        let b = store.insert(running(owner, None, &clock)).await.unwrap();
        store.insert(running(Uuid::new_v4(), None, &clock)).await.unwrap();

        let now = clock.now();
        store
            .update(b.id, owner, Box::new(move |s: &TimerSession| state::cancel(s, now)))
            .await
            .unwrap();

        let active: Vec<_> = store.list_active(owner).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(active, vec![a.id]);
        let all: Vec<_> = store.list_all(owner).await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(all, vec![a.id, b.id]);

        assert!(matches!(
            store.delete(a.id, Uuid::new_v4()).await,
            Err(PortError::NotFound(_))
        ));
        store.delete(a.id, owner).await.unwrap();
        assert!(matches!(store.get(a.id).await, Err(PortError::NotFound(_))));
    }

    #[tokio::test]
    async fn save_overwrites_record_and_bumps_updated_at() {
        let (clock, store) = store();
        let owner = Uuid::new_v4();
        let timer = store.insert(running(owner, None, &clock)).await.unwrap();

        clock.advance_secs(7);
        let mut edited = timer.clone();
        edited.title = Some("Planning".to_string());
        let saved = store.save(edited).await.unwrap();

        assert_eq!(saved.title.as_deref(), Some("Planning"));
        assert_eq!(saved.updated_at, clock.now());
        assert_ne!(saved.updated_at, timer.updated_at);
        assert_eq!(store.get(timer.id).await.unwrap(), saved);

        let missing = running(owner, None, &clock);
        assert!(matches!(store.save(missing.clone()).await, Err(PortError::NotFound(_))));
        assert!(matches!(store.get(missing.id).await, Err(PortError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_ids_leave_no_lock_entries() {
        let (clock, store) = store();
        let owner = Uuid::new_v4();
        let now = clock.now();

        for _ in 0..100 {
            let err = store
                .update(Uuid::new_v4(), owner, Box::new(move |s: &TimerSession| state::pause(s, now)))
                .await
                .unwrap_err();
            assert!(matches!(err, PortError::NotFound(_)));
            assert!(matches!(
                store.delete(Uuid::new_v4(), owner).await,
                Err(PortError::NotFound(_))
            ));
            assert!(matches!(
                store.save(running(owner, None, &clock)).await,
                Err(PortError::NotFound(_))
            ));
        }
        assert_eq!(store.locks.len(), 0);

        // Misses on a stored timer's id keep its lock; deleting it drops the lock.
        let timer = store.insert(running(owner, None, &clock)).await.unwrap();
        store
            .update(timer.id, owner, Box::new(move |s: &TimerSession| state::pause(s, now)))
            .await
            .unwrap();
        assert!(store.delete(timer.id, Uuid::new_v4()).await.is_err());
        assert_eq!(store.locks.len(), 1);
        store.delete(timer.id, owner).await.unwrap();
        assert_eq!(store.locks.len(), 0);
    }
}
