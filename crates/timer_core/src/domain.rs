//! crates/timer_core/src/domain.rs
//!
//! Defines the pure, core data structures for the timer engine.
//! These structs are independent of any database or serialization format.

use crate::state::TimerError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

//=========================================================================================
// Status and Audit Actions
//=========================================================================================

/// The lifecycle state of a timer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerStatus {
    NotStarted,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerStatus::NotStarted => "NOT_STARTED",
            TimerStatus::Running => "RUNNING",
            TimerStatus::Paused => "PAUSED",
            TimerStatus::Completed => "COMPLETED",
            TimerStatus::Cancelled => "CANCELLED",
        }
    }

    /// RUNNING or PAUSED. This is what the store means by "active".
    pub fn is_active(&self) -> bool {
        matches!(self, TimerStatus::Running | TimerStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerStatus::Completed | TimerStatus::Cancelled)
    }
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted status or action string is not one of the known values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown value: {0}")]
pub struct UnknownVariant(pub String);

impl FromStr for TimerStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(TimerStatus::NotStarted),
            "RUNNING" => Ok(TimerStatus::Running),
            "PAUSED" => Ok(TimerStatus::Paused),
            "COMPLETED" => Ok(TimerStatus::Completed),
            "CANCELLED" => Ok(TimerStatus::Cancelled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A transition recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerAction {
    Start,
    Pause,
    Resume,
    Stop,
    Cancel,
}

impl TimerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerAction::Start => "start",
            TimerAction::Pause => "pause",
            TimerAction::Resume => "resume",
            TimerAction::Stop => "stop",
            TimerAction::Cancel => "cancel",
        }
    }
}

impl fmt::Display for TimerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerAction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(TimerAction::Start),
            "pause" => Ok(TimerAction::Pause),
            "resume" => Ok(TimerAction::Resume),
            "stop" => Ok(TimerAction::Stop),
            "cancel" => Ok(TimerAction::Cancel),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

//=========================================================================================
// Audit Log
//=========================================================================================

/// A single entry of a timer's pause history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseEntry {
    pub action: TimerAction,
    pub at: DateTime<Utc>,
    /// Accumulated elapsed seconds, recorded on pause/stop/cancel.
    pub elapsed: Option<i64>,
}

/// Append-only, ordered log of the transitions applied to a timer.
///
/// Entries can be read but never edited or removed. `append` consumes the log
/// and hands back the extended one, so a session value never observes another
/// session's history changing underneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditLog(Vec<PauseEntry>);

impl AuditLog {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Rebuilds a log from persisted entries, in stored order.
    pub fn from_entries(entries: Vec<PauseEntry>) -> Self {
        Self(entries)
    }

    #[must_use]
    pub fn append(mut self, entry: PauseEntry) -> Self {
        self.0.push(entry);
        self
    }

    pub fn entries(&self) -> &[PauseEntry] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &PauseEntry> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&PauseEntry> {
        self.0.last()
    }
}

//=========================================================================================
// Timer Session
//=========================================================================================

/// What a timer is tracking time for. At most one link per timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkedEntity {
    /// A calendar event.
    Schedule(Uuid),
    Todo(Uuid),
}

impl LinkedEntity {
    /// Builds the link from the two optional wire/database columns.
    pub fn from_parts(
        schedule_id: Option<Uuid>,
        todo_id: Option<Uuid>,
    ) -> Result<Option<Self>, TimerError> {
        match (schedule_id, todo_id) {
            (Some(_), Some(_)) => Err(TimerError::InvalidField(
                "a timer can be linked to a schedule or a todo, not both".to_string(),
            )),
            (Some(id), None) => Ok(Some(LinkedEntity::Schedule(id))),
            (None, Some(id)) => Ok(Some(LinkedEntity::Todo(id))),
            (None, None) => Ok(None),
        }
    }
}

/// A single tracked duration-of-work record, owned by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub linked_entity: Option<LinkedEntity>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Target duration in seconds, always positive.
    pub allocated_duration: i64,
    /// Accumulated run time in seconds, folded in at transition boundaries.
    pub elapsed_time: i64,
    pub status: TimerStatus,
    /// Anchor of the current running segment (most recent start or resume).
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pause_history: AuditLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TimerSession {
    pub fn schedule_id(&self) -> Option<Uuid> {
        match self.linked_entity {
            Some(LinkedEntity::Schedule(id)) => Some(id),
            _ => None,
        }
    }

    pub fn todo_id(&self) -> Option<Uuid> {
        match self.linked_entity {
            Some(LinkedEntity::Todo(id)) => Some(id),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// The caller-supplied fields used to create a new timer.
#[derive(Debug, Clone, Default)]
pub struct TimerDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub allocated_duration: i64,
    pub schedule_id: Option<Uuid>,
    pub todo_id: Option<Uuid>,
}

/// A partial update of a timer's descriptive fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct TimerPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub allocated_duration: Option<i64>,
}
