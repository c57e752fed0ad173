//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `TimerStore` port from the `core` crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.
//!
//! Per-timer serialization comes from `SELECT ... FOR UPDATE` inside the update
//! transaction. One active timer per linked entity is enforced by partial unique
//! indexes (see `migrations/`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgExecutor, PgPool};
use std::sync::Arc;
use timer_core::clock::Clock;
use timer_core::domain::{AuditLog, LinkedEntity, PauseEntry, TimerSession};
use timer_core::ports::{PortError, PortResult, TimerStore, Transition};
use timer_core::state::TimerError;
use tracing::debug;
use uuid::Uuid;

const COLUMNS: &str = "id, owner_id, schedule_id, todo_id, title, description, \
    allocated_duration, elapsed_time, status, started_at, paused_at, ended_at, \
    pause_history, created_at, updated_at";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `TimerStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn fetch_many(&self, sql: &str, owner_id: Uuid) -> PortResult<Vec<TimerSession>> {
        let records = sqlx::query_as::<_, TimerRecord>(sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?;
        records.into_iter().map(TimerRecord::to_domain).collect()
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(Serialize, Deserialize)]
struct PauseEntryRecord {
    action: String,
    at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    elapsed: Option<i64>,
}

#[derive(FromRow)]
struct TimerRecord {
    id: Uuid,
    owner_id: Uuid,
    schedule_id: Option<Uuid>,
    todo_id: Option<Uuid>,
    title: Option<String>,
    description: Option<String>,
    allocated_duration: i64,
    elapsed_time: i64,
    status: String,
    started_at: Option<DateTime<Utc>>,
    paused_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    pause_history: Json<Vec<PauseEntryRecord>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TimerRecord {
    fn to_domain(self) -> PortResult<TimerSession> {
        let corrupt = |e: &dyn std::fmt::Display| {
            PortError::Unexpected(format!("Timer {} has a corrupt record: {}", self.id, e))
        };
        let status = self.status.parse().map_err(|e| corrupt(&e))?;
        let linked_entity =
            LinkedEntity::from_parts(self.schedule_id, self.todo_id).map_err(|e| corrupt(&e))?;
        let entries = self
            .pause_history
            .0
            .into_iter()
            .map(|entry| {
                Ok(PauseEntry {
                    action: entry.action.parse().map_err(|e| corrupt(&e))?,
                    at: entry.at,
                    elapsed: entry.elapsed,
                })
            })
            .collect::<PortResult<Vec<_>>>()?;

        Ok(TimerSession {
            id: self.id,
            owner_id: self.owner_id,
            linked_entity,
            title: self.title,
            description: self.description,
            allocated_duration: self.allocated_duration,
            elapsed_time: self.elapsed_time,
            status,
            started_at: self.started_at,
            paused_at: self.paused_at,
            ended_at: self.ended_at,
            pause_history: AuditLog::from_entries(entries),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn history_record(history: &AuditLog) -> Json<Vec<PauseEntryRecord>> {
    Json(
        history
            .iter()
            .map(|entry| PauseEntryRecord {
                action: entry.action.as_str().to_string(),
                at: entry.at,
                elapsed: entry.elapsed,
            })
            .collect(),
    )
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Maps a unique-index violation on the active-entity indexes to `EntityBusy`.
fn write_error(e: sqlx::Error, session: &TimerSession) -> PortError {
    match (&e, session.linked_entity) {
        (sqlx::Error::Database(db), Some(entity)) if db.is_unique_violation() => {
            TimerError::EntityBusy(entity).into()
        }
        _ => unexpected(e),
    }
}

/// Writes every mutable column of `session` and returns the stored row.
async fn write_record<'e, E: PgExecutor<'e>>(
    executor: E,
    session: &TimerSession,
) -> PortResult<TimerSession> {
    let sql = format!(
        "UPDATE timers SET title = $2, description = $3, allocated_duration = $4, \
         elapsed_time = $5, status = $6, started_at = $7, paused_at = $8, ended_at = $9, \
         pause_history = $10, updated_at = $11 WHERE id = $1 RETURNING {COLUMNS}"
    );
    let record = sqlx::query_as::<_, TimerRecord>(&sql)
        .bind(session.id)
        .bind(&session.title)
        .bind(&session.description)
        .bind(session.allocated_duration)
        .bind(session.elapsed_time)
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(session.paused_at)
        .bind(session.ended_at)
        .bind(history_record(&session.pause_history))
        .bind(session.updated_at)
        .fetch_optional(executor)
        .await
        .map_err(|e| write_error(e, session))?
        .ok_or_else(|| PortError::NotFound(format!("Timer {} not found", session.id)))?;
    record.to_domain()
}

//=========================================================================================
// `TimerStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl TimerStore for DbAdapter {
    async fn get(&self, id: Uuid) -> PortResult<TimerSession> {
        let sql = format!("SELECT {COLUMNS} FROM timers WHERE id = $1");
        let record = sqlx::query_as::<_, TimerRecord>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => PortError::NotFound(format!("Timer {} not found", id)),
                _ => unexpected(e),
            })?;
        record.to_domain()
    }

    async fn insert(&self, mut session: TimerSession) -> PortResult<TimerSession> {
        session.updated_at = self.clock.now();
        let sql = format!(
            "INSERT INTO timers ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {COLUMNS}"
        );
        let record = sqlx::query_as::<_, TimerRecord>(&sql)
            .bind(session.id)
            .bind(session.owner_id)
            .bind(session.schedule_id())
            .bind(session.todo_id())
            .bind(&session.title)
            .bind(&session.description)
            .bind(session.allocated_duration)
            .bind(session.elapsed_time)
            .bind(session.status.as_str())
            .bind(session.started_at)
            .bind(session.paused_at)
            .bind(session.ended_at)
            .bind(history_record(&session.pause_history))
            .bind(session.created_at)
            .bind(session.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| write_error(e, &session))?;
        record.to_domain()
    }

    async fn save(&self, mut session: TimerSession) -> PortResult<TimerSession> {
        session.updated_at = self.clock.now();
        write_record(&self.pool, &session).await
    }

    async fn update(
        &self,
        id: Uuid,
        owner_id: Uuid,
        transition: Transition,
    ) -> PortResult<TimerSession> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let sql = format!("SELECT {COLUMNS} FROM timers WHERE id = $1 AND owner_id = $2 FOR UPDATE");
        let current = sqlx::query_as::<_, TimerRecord>(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| PortError::NotFound(format!("Timer {} not found", id)))?
            .to_domain()?;

        // Dropping `tx` on rejection rolls back and releases the row lock.
        let mut next = transition(&current)?;
        next.updated_at = self.clock.now();
        let saved = write_record(&mut *tx, &next).await?;

        tx.commit().await.map_err(unexpected)?;
        debug!(timer_id = %id, status = %saved.status, "Timer row updated");
        Ok(saved)
    }

    async fn list_active(&self, owner_id: Uuid) -> PortResult<Vec<TimerSession>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM timers WHERE owner_id = $1 \
             AND status IN ('RUNNING', 'PAUSED') ORDER BY created_at ASC, id ASC"
        );
        self.fetch_many(&sql, owner_id).await
    }

    async fn list_all(&self, owner_id: Uuid) -> PortResult<Vec<TimerSession>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM timers WHERE owner_id = $1 ORDER BY created_at ASC, id ASC"
        );
        self.fetch_many(&sql, owner_id).await
    }

    async fn find_active_for_entity(
        &self,
        owner_id: Uuid,
        entity: LinkedEntity,
    ) -> PortResult<TimerSession> {
        let (column, entity_id) = match entity {
            LinkedEntity::Schedule(id) => ("schedule_id", id),
            LinkedEntity::Todo(id) => ("todo_id", id),
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM timers WHERE owner_id = $1 AND {column} = $2 \
             AND status IN ('RUNNING', 'PAUSED') LIMIT 1"
        );
        let record = sqlx::query_as::<_, TimerRecord>(&sql)
            .bind(owner_id)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?
            .ok_or_else(|| PortError::NotFound(format!("No active timer for {:?}", entity)))?;
        record.to_domain()
    }

    async fn delete(&self, id: Uuid, owner_id: Uuid) -> PortResult<()> {
        let result = sqlx::query("DELETE FROM timers WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Timer {} not found", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use timer_core::domain::{TimerAction, TimerDraft, TimerStatus};
    use timer_core::state;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn record_of(session: &TimerSession) -> TimerRecord {
        TimerRecord {
            id: session.id,
            owner_id: session.owner_id,
            schedule_id: session.schedule_id(),
            todo_id: session.todo_id(),
            title: session.title.clone(),
            description: session.description.clone(),
            allocated_duration: session.allocated_duration,
            elapsed_time: session.elapsed_time,
            status: session.status.as_str().to_string(),
            started_at: session.started_at,
            paused_at: session.paused_at,
            ended_at: session.ended_at,
            pause_history: history_record(&session.pause_history),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }

    fn paused_timer() -> TimerSession {
        let draft = TimerDraft {
            title: Some("Review".to_string()),
            allocated_duration: 900,
            todo_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let timer = state::create(Uuid::new_v4(), draft, t(0)).unwrap();
        let timer = state::start(&timer, t(1)).unwrap();
        state::pause(&timer, t(61)).unwrap()
    }

    #[test]
    fn record_maps_back_to_the_same_session() {
        let timer = paused_timer();
        let restored = record_of(&timer).to_domain().unwrap();

        assert_eq!(restored, timer);
        assert_eq!(restored.status, TimerStatus::Paused);
        let actions: Vec<_> = restored.pause_history.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![TimerAction::Start, TimerAction::Pause]);
        assert_eq!(restored.pause_history.last().unwrap().elapsed, Some(60));
    }

    #[test]
    fn history_is_stored_with_lowercase_actions() {
        let json = serde_json::to_value(&history_record(&paused_timer().pause_history).0).unwrap();
        assert_eq!(json[0]["action"], "start");
        assert!(json[0].get("elapsed").is_none());
        assert_eq!(json[1]["action"], "pause");
        assert_eq!(json[1]["elapsed"], 60);
    }

    #[test]
    fn corrupt_status_is_reported() {
        let mut record = record_of(&paused_timer());
        record.status = "SNOOZED".to_string();
        let err = record.to_domain().unwrap_err();
        assert!(matches!(err, PortError::Unexpected(ref message) if message.contains("SNOOZED")));
    }

    #[test]
    fn corrupt_history_action_is_reported() {
        let mut record = record_of(&paused_timer());
        record.pause_history.0[1].action = "snooze".to_string();
        assert!(matches!(record.to_domain(), Err(PortError::Unexpected(_))));
    }

    #[test]
    fn record_linked_to_both_entities_is_reported() {
        let mut record = record_of(&paused_timer());
        record.schedule_id = Some(Uuid::new_v4());
        assert!(matches!(record.to_domain(), Err(PortError::Unexpected(_))));
    }
}
