//! crates/timer_core/src/state.rs
//!
//! The timer state machine. Every transition is a pure function of the current
//! session and the current instant: it either returns the next session value or
//! rejects the request, leaving the input untouched.
//!
//! Elapsed time only accrues while RUNNING, and is folded in at transition
//! boundaries. The fold sums every running segment recorded in the audit log
//! plus the open one (`now - started_at`) in milliseconds, then floors to whole
//! seconds, so sub-second remainders carry over instead of being lost per segment.

use crate::domain::{
    AuditLog, LinkedEntity, PauseEntry, TimerAction, TimerDraft, TimerPatch, TimerSession,
    TimerStatus,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Rejections produced by the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("Cannot {action} a timer that is {status}")]
    InvalidTransition {
        action: TimerAction,
        status: TimerStatus,
    },
    #[error("Invalid field: {0}")]
    InvalidField(String),
    /// Another RUNNING or PAUSED timer is already tracking this entity.
    #[error("An active timer already exists for {0:?}")]
    EntityBusy(LinkedEntity),
}

pub type TimerResult<T> = Result<T, TimerError>;

/// Builds a NOT_STARTED timer for `owner_id` from a validated draft.
pub fn create(owner_id: Uuid, draft: TimerDraft, now: DateTime<Utc>) -> TimerResult<TimerSession> {
    validate_duration(draft.allocated_duration)?;
    let linked_entity = LinkedEntity::from_parts(draft.schedule_id, draft.todo_id)?;

    Ok(TimerSession {
        id: Uuid::new_v4(),
        owner_id,
        linked_entity,
        title: draft.title,
        description: draft.description,
        allocated_duration: draft.allocated_duration,
        elapsed_time: 0,
        status: TimerStatus::NotStarted,
        started_at: None,
        paused_at: None,
        ended_at: None,
        pause_history: AuditLog::new(),
        created_at: now,
        updated_at: now,
    })
}

pub fn start(session: &TimerSession, now: DateTime<Utc>) -> TimerResult<TimerSession> {
    require(session, TimerAction::Start, &[TimerStatus::NotStarted])?;

    let mut next = session.clone();
    next.status = TimerStatus::Running;
    next.started_at = Some(now);
    next.updated_at = now;
    next.pause_history = record(next.pause_history, TimerAction::Start, now, None);
    Ok(next)
}

pub fn pause(session: &TimerSession, now: DateTime<Utc>) -> TimerResult<TimerSession> {
    require(session, TimerAction::Pause, &[TimerStatus::Running])?;

    let mut next = session.clone();
    next.elapsed_time = folded_elapsed(session, now);
    next.status = TimerStatus::Paused;
    next.paused_at = Some(now);
    next.updated_at = now;
    next.pause_history = record(
        next.pause_history,
        TimerAction::Pause,
        now,
        Some(next.elapsed_time),
    );
    Ok(next)
}

pub fn resume(session: &TimerSession, now: DateTime<Utc>) -> TimerResult<TimerSession> {
    require(session, TimerAction::Resume, &[TimerStatus::Paused])?;

    let mut next = session.clone();
    next.status = TimerStatus::Running;
    next.started_at = Some(now);
    next.paused_at = None;
    next.updated_at = now;
    next.pause_history = record(next.pause_history, TimerAction::Resume, now, None);
    Ok(next)
}

pub fn stop(session: &TimerSession, now: DateTime<Utc>) -> TimerResult<TimerSession> {
    require(
        session,
        TimerAction::Stop,
        &[TimerStatus::Running, TimerStatus::Paused],
    )?;
    Ok(finish(session, TimerAction::Stop, TimerStatus::Completed, now))
}

pub fn cancel(session: &TimerSession, now: DateTime<Utc>) -> TimerResult<TimerSession> {
    require(
        session,
        TimerAction::Cancel,
        &[
            TimerStatus::NotStarted,
            TimerStatus::Running,
            TimerStatus::Paused,
        ],
    )?;
    Ok(finish(session, TimerAction::Cancel, TimerStatus::Cancelled, now))
}

/// Dispatches to the transition named by `action`.
pub fn apply(
    session: &TimerSession,
    action: TimerAction,
    now: DateTime<Utc>,
) -> TimerResult<TimerSession> {
    match action {
        TimerAction::Start => start(session, now),
        TimerAction::Pause => pause(session, now),
        TimerAction::Resume => resume(session, now),
        TimerAction::Stop => stop(session, now),
        TimerAction::Cancel => cancel(session, now),
    }
}

/// Merges descriptive fields. Status, timing and history are never touched.
pub fn update_fields(
    session: &TimerSession,
    patch: TimerPatch,
    now: DateTime<Utc>,
) -> TimerResult<TimerSession> {
    if let Some(duration) = patch.allocated_duration {
        validate_duration(duration)?;
    }

    let mut next = session.clone();
    if let Some(title) = patch.title {
        next.title = Some(title);
    }
    if let Some(description) = patch.description {
        next.description = Some(description);
    }
    if let Some(duration) = patch.allocated_duration {
        next.allocated_duration = duration;
    }
    next.updated_at = now;
    Ok(next)
}

/// Elapsed seconds including the in-flight running segment. For display only;
/// the persisted `elapsed_time` changes exclusively at transitions.
pub fn current_elapsed(session: &TimerSession, now: DateTime<Utc>) -> i64 {
    match session.status {
        TimerStatus::Running => folded_elapsed(session, now),
        _ => session.elapsed_time,
    }
}

/// Seconds left until `allocated_duration` is reached, never negative.
pub fn remaining(session: &TimerSession, now: DateTime<Utc>) -> i64 {
    (session.allocated_duration - current_elapsed(session, now)).max(0)
}

//=========================================================================================
// Helpers
//=========================================================================================

fn require(session: &TimerSession, action: TimerAction, allowed: &[TimerStatus]) -> TimerResult<()> {
    if allowed.contains(&session.status) {
        Ok(())
    } else {
        Err(TimerError::InvalidTransition {
            action,
            status: session.status,
        })
    }
}

fn validate_duration(duration: i64) -> TimerResult<()> {
    if duration <= 0 {
        return Err(TimerError::InvalidField(format!(
            "allocated_duration must be positive, got {}",
            duration
        )));
    }
    Ok(())
}

/// Whole seconds spent RUNNING up to `now`. Never less than the stored
/// `elapsed_time`.
fn folded_elapsed(session: &TimerSession, now: DateTime<Utc>) -> i64 {
    match (session.status, session.started_at) {
        (TimerStatus::Running, Some(anchor)) => {
            let total = closed_segments_millis(&session.pause_history) + segment_millis(anchor, now);
            (total / 1000).max(session.elapsed_time)
        }
        _ => session.elapsed_time,
    }
}

/// Milliseconds of every running segment the log has already closed.
fn closed_segments_millis(log: &AuditLog) -> i64 {
    let mut open = None;
    let mut total = 0;
    for entry in log.iter() {
        match entry.action {
            TimerAction::Start | TimerAction::Resume => open = Some(entry.at),
            TimerAction::Pause | TimerAction::Stop | TimerAction::Cancel => {
                if let Some(from) = open.take() {
                    total += segment_millis(from, entry.at);
                }
            }
        }
    }
    total
}

/// A segment that would be negative (clock stepped back) counts as zero.
fn segment_millis(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}

fn finish(
    session: &TimerSession,
    action: TimerAction,
    terminal: TimerStatus,
    now: DateTime<Utc>,
) -> TimerSession {
    let mut next = session.clone();
    next.elapsed_time = folded_elapsed(session, now);
    next.status = terminal;
    next.ended_at = Some(now);
    next.updated_at = now;
    next.pause_history = record(next.pause_history, action, now, Some(next.elapsed_time));
    next
}

fn record(log: AuditLog, action: TimerAction, at: DateTime<Utc>, elapsed: Option<i64>) -> AuditLog {
    log.append(PauseEntry {
        action,
        at,
        elapsed,
    })
}
