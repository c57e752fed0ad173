//! services/api/src/web/protocol.rs
//!
//! Defines the WebSocket message protocol between timer clients (desktop, mobile,
//! browser tabs) and the API server.
//!
//! Every frame is a JSON envelope `{"type": "...", "payload": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use timer_core::domain::{PauseEntry, TimerSession};
use timer_core::ports::PortError;
use timer_core::state::TimerError;
use utoipa::ToSchema;
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Client TO the Server
//=========================================================================================

/// The raw envelope. Decoding happens in two steps so that a malformed body and
/// an unrecognized `type` can be told apart.
#[derive(Deserialize, Debug)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CreateTimer {
    pub title: Option<String>,
    pub description: Option<String>,
    pub allocated_duration: i64,
    pub schedule_id: Option<Uuid>,
    pub todo_id: Option<Uuid>,
    /// Start the timer right away. Defaults to `true`.
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

/// Payload of the commands addressing one timer. The id stays a string here: an
/// id that does not parse is reported as an unknown timer, not a malformed frame.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct TimerRef {
    pub timer_id: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UpdateTimer {
    pub timer_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub allocated_duration: Option<i64>,
}

/// Which timers a sync snapshot contains.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SyncScope {
    /// RUNNING or PAUSED timers only.
    #[default]
    Active,
    All,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SyncRequest {
    #[serde(default)]
    pub scope: SyncScope,
}

/// Represents the commands a client can send to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Create(CreateTimer),
    Start(TimerRef),
    Pause(TimerRef),
    Resume(TimerRef),
    Stop(TimerRef),
    Cancel(TimerRef),
    Update(UpdateTimer),
    Delete(TimerRef),
    Sync(SyncRequest),
}

impl ClientMessage {
    /// Parses one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| GatewayError::new(ErrorCode::ParseError, e.to_string()))?;

        // A missing payload reads as an empty object, so `timer.sync` needs none.
        let payload = match envelope.payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other,
        };

        let message = match envelope.kind.as_str() {
            "timer.create" => ClientMessage::Create(payload_as(payload)?),
            "timer.start" => ClientMessage::Start(payload_as(payload)?),
            "timer.pause" => ClientMessage::Pause(payload_as(payload)?),
            "timer.resume" => ClientMessage::Resume(payload_as(payload)?),
            "timer.stop" => ClientMessage::Stop(payload_as(payload)?),
            "timer.cancel" => ClientMessage::Cancel(payload_as(payload)?),
            "timer.update" => ClientMessage::Update(payload_as(payload)?),
            "timer.delete" => ClientMessage::Delete(payload_as(payload)?),
            "timer.sync" => ClientMessage::Sync(payload_as(payload)?),
            other => {
                return Err(GatewayError::new(
                    ErrorCode::UnknownType,
                    format!("Unknown message type: {}", other),
                ))
            }
        };
        Ok(message)
    }
}

fn payload_as<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, GatewayError> {
    serde_json::from_value(payload)
        .map_err(|e| GatewayError::new(ErrorCode::ParseError, format!("Invalid payload: {}", e)))
}

//=========================================================================================
// Messages Sent FROM the Server TO the Client
//=========================================================================================

/// Represents the messages the server pushes to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    /// First message on every connection.
    #[serde(rename = "connected")]
    Connected { user_id: Uuid },

    /// A timer changed. Sent to every connection of the owner.
    #[serde(rename = "timer.updated")]
    TimerUpdated(TimerView),

    /// A snapshot of the owner's timers.
    #[serde(rename = "timer.sync_result")]
    SyncResult { timers: Vec<TimerView>, count: usize },

    /// Direct reply to the connection that issued a timer command.
    #[serde(rename = "timer.ack")]
    Ack { action: String, timer: TimerView },

    /// A timer was deleted.
    #[serde(rename = "timer.deleted")]
    TimerDeleted { timer_id: Uuid },

    /// A request from this connection was rejected. Never broadcast.
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    pub fn sync_result(timers: &[TimerSession]) -> Self {
        let timers: Vec<TimerView> = timers.iter().map(TimerView::from).collect();
        ServerMessage::SyncResult {
            count: timers.len(),
            timers,
        }
    }

    /// The envelope `type` string, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::TimerUpdated(_) => "timer.updated",
            ServerMessage::SyncResult { .. } => "timer.sync_result",
            ServerMessage::Ack { .. } => "timer.ack",
            ServerMessage::TimerDeleted { .. } => "timer.deleted",
            ServerMessage::Error { .. } => "error",
        }
    }
}

//=========================================================================================
// Wire Representation of a Timer
//=========================================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct PauseEntryView {
    pub action: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<i64>,
}

impl From<&PauseEntry> for PauseEntryView {
    fn from(entry: &PauseEntry) -> Self {
        Self {
            action: entry.action.as_str().to_string(),
            at: entry.at,
            elapsed: entry.elapsed,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, ToSchema)]
pub struct TimerView {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub todo_id: Option<Uuid>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub allocated_duration: i64,
    pub elapsed_time: i64,
    /// NOT_STARTED, RUNNING, PAUSED, COMPLETED or CANCELLED.
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub pause_history: Vec<PauseEntryView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TimerSession> for TimerView {
    fn from(session: &TimerSession) -> Self {
        Self {
            id: session.id,
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
            pause_history: session.pause_history.iter().map(PauseEntryView::from).collect(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

//=========================================================================================
// Errors Reported Over the Wire
//=========================================================================================

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    UnknownType,
    NotFound,
    InvalidTransition,
    InvalidField,
    /// The store failed for a reason unrelated to the request.
    Internal,
}

/// A rejected request, converted into an `error` message for the requesting
/// connection only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn into_message(self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code,
            message: self.message,
        }
    }
}

impl From<TimerError> for GatewayError {
    fn from(e: TimerError) -> Self {
        let code = match e {
            TimerError::InvalidTransition { .. } | TimerError::EntityBusy(_) => {
                ErrorCode::InvalidTransition
            }
            TimerError::InvalidField(_) => ErrorCode::InvalidField,
        };
        Self::new(code, e.to_string())
    }
}

impl From<PortError> for GatewayError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::NotFound(message) => Self::new(ErrorCode::NotFound, message),
            PortError::Rejected(rejection) => rejection.into(),
            PortError::Unexpected(message) => Self::new(ErrorCode::Internal, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_commands_and_defaults() {
        let msg = ClientMessage::decode(
            r#"{"type":"timer.create","payload":{"allocated_duration":1800,"title":"Focus"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Create(create) => {
                assert_eq!(create.allocated_duration, 1800);
                assert_eq!(create.title.as_deref(), Some("Focus"));
                assert!(create.autostart);
                assert_eq!(create.todo_id, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg = ClientMessage::decode(r#"{"type":"timer.sync"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Sync(SyncRequest { scope: SyncScope::Active }));

        let msg = ClientMessage::decode(r#"{"type":"timer.sync","payload":{"scope":"all"}}"#).unwrap();
        assert_eq!(msg, ClientMessage::Sync(SyncRequest { scope: SyncScope::All }));

        let msg = ClientMessage::decode(r#"{"type":"timer.pause","payload":{"timer_id":"abc"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Pause(TimerRef {
                timer_id: "abc".to_string()
            })
        );
    }

    #[test]
    fn malformed_frames_are_parse_errors() {
        for frame in [
            "not json",
            r#"{"payload":{}}"#,
            r#"{"type":"timer.create","payload":{"title":"no duration"}}"#,
            r#"{"type":"timer.pause","payload":{}}"#,
            r#"{"type":"timer.sync","payload":{"scope":"weekly"}}"#,
        ] {
            let err = ClientMessage::decode(frame).unwrap_err();
            assert_eq!(err.code, ErrorCode::ParseError, "frame: {}", frame);
        }
    }

    #[test]
    fn unknown_type_is_reported_as_such() {
        let err = ClientMessage::decode(r#"{"type":"timer.rewind","payload":{}}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownType);
    }

    #[test]
    fn server_messages_use_type_payload_envelope() {
        let user_id = Uuid::new_v4();
        let value = serde_json::to_value(ServerMessage::Connected { user_id }).unwrap();
        assert_eq!(value, json!({"type": "connected", "payload": {"user_id": user_id}}));

        let value = serde_json::to_value(
            GatewayError::not_found("Timer x not found").into_message(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "payload": {"code": "NOT_FOUND", "message": "Timer x not found"}})
        );

        let value = serde_json::to_value(ServerMessage::sync_result(&[])).unwrap();
        assert_eq!(
            value,
            json!({"type": "timer.sync_result", "payload": {"timers": [], "count": 0}})
        );
    }
}
