//! crates/timer_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the timer engine.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of specific persistence implementations.

use crate::domain::{LinkedEntity, TimerSession};
use crate::state::TimerError;
use async_trait::async_trait;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The record does not exist, or belongs to another user.
    #[error("Item not found: {0}")]
    NotFound(String),
    /// The state machine refused the change; nothing was written.
    #[error(transparent)]
    Rejected(#[from] TimerError),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// A read-modify-write step applied by [`TimerStore::update`] to the latest
/// committed state of a timer.
pub type Transition = Box<dyn FnOnce(&TimerSession) -> Result<TimerSession, TimerError> + Send>;

//=========================================================================================
// Store Port
//=========================================================================================

/// Persistence contract for timer sessions.
///
/// Mutations of a single timer are serialized: while one `update` for an id is
/// in flight, every other `update` for the same id waits, then sees its result.
/// Updates of different ids do not contend.
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn get(&self, id: Uuid) -> PortResult<TimerSession>;

    /// Persists a new timer. Fails with `TimerError::EntityBusy` if it is active
    /// and another active timer already tracks the same linked entity.
    async fn insert(&self, session: TimerSession) -> PortResult<TimerSession>;

    /// Unconditional write of a whole record. Bumps `updated_at`.
    async fn save(&self, session: TimerSession) -> PortResult<TimerSession>;

    /// Loads `id` under the per-timer write lock, checks it belongs to
    /// `owner_id`, applies `transition` and persists the result. A rejected
    /// transition leaves the stored record untouched.
    async fn update(&self, id: Uuid, owner_id: Uuid, transition: Transition)
        -> PortResult<TimerSession>;

    /// Timers of `owner_id` that are RUNNING or PAUSED, oldest first.
    async fn list_active(&self, owner_id: Uuid) -> PortResult<Vec<TimerSession>>;

    /// Every timer of `owner_id`, oldest first.
    async fn list_all(&self, owner_id: Uuid) -> PortResult<Vec<TimerSession>>;

    async fn find_active_for_entity(
        &self,
        owner_id: Uuid,
        entity: LinkedEntity,
    ) -> PortResult<TimerSession>;

    async fn delete(&self, id: Uuid, owner_id: Uuid) -> PortResult<()>;
}
