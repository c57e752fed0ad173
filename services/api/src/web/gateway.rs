//! services/api/src/web/gateway.rs
//!
//! The per-connection protocol handler. One `SessionGateway` exists per live
//! connection and handles that connection's inbound messages one at a time, so a
//! single connection never has two transitions in flight.
//!
//! The gateway knows nothing about sockets: it writes to the connection's
//! outbound queue, and the transport (see `ws_handler`) drains that queue.

use crate::web::{
    protocol::{
        ClientMessage, CreateTimer, GatewayError, ServerMessage, SyncScope, TimerView, UpdateTimer,
    },
    registry::ConnectionHandle,
    state::AppState,
};
use std::sync::Arc;
use timer_core::clock::Clock;
use timer_core::domain::{TimerAction, TimerDraft, TimerPatch, TimerSession};
use timer_core::ports::TimerStore;
use timer_core::state;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SessionGateway {
    app_state: Arc<AppState>,
    owner_id: Uuid,
    connection: ConnectionHandle,
}

impl SessionGateway {
    pub fn new(app_state: Arc<AppState>, owner_id: Uuid, connection: ConnectionHandle) -> Self {
        Self {
            app_state,
            owner_id,
            connection,
        }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection.id
    }

    /// Registers the connection, then sends `connected` followed by the active
    /// snapshot. Clients get both without asking.
    pub async fn on_connect(&self) {
        self.app_state
            .registry
            .register(self.owner_id, self.connection.clone());
        info!(
            owner_id = %self.owner_id,
            connection_id = %self.connection.id,
            "Timer connection opened"
        );

        self.reply(ServerMessage::Connected {
            user_id: self.owner_id,
        });
        match load_snapshot(self.app_state.store.as_ref(), self.owner_id, SyncScope::Active).await {
            Ok(timers) => self.reply(ServerMessage::sync_result(&timers)),
            Err(e) => self.reply(e.into_message()),
        }
    }

    /// Handles one inbound text frame. Failures are reported to this connection
    /// only and never end it.
    pub async fn handle_text(&self, text: &str) {
        let outcome = match ClientMessage::decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(reply) => self.reply(reply),
            Err(e) => {
                warn!(
                    owner_id = %self.owner_id,
                    connection_id = %self.connection.id,
                    code = ?e.code,
                    "Rejected timer request: {}",
                    e.message
                );
                self.reply(e.into_message());
            }
        }
    }

    pub fn on_disconnect(&self) {
        self.app_state
            .registry
            .unregister(self.owner_id, self.connection.id);
        info!(
            owner_id = %self.owner_id,
            connection_id = %self.connection.id,
            "Timer connection closed"
        );
    }

    /// Queues a message for this connection only.
    pub fn reply(&self, message: ServerMessage) {
        if self.connection.send(message).is_err() {
            debug!(connection_id = %self.connection.id, "Reply dropped, connection is gone");
        }
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<ServerMessage, GatewayError> {
        match message {
            ClientMessage::Create(create) => self.create(create).await,
            ClientMessage::Start(target) => self.transition(&target.timer_id, TimerAction::Start).await,
            ClientMessage::Pause(target) => self.transition(&target.timer_id, TimerAction::Pause).await,
            ClientMessage::Resume(target) => self.transition(&target.timer_id, TimerAction::Resume).await,
            ClientMessage::Stop(target) => self.transition(&target.timer_id, TimerAction::Stop).await,
            ClientMessage::Cancel(target) => self.transition(&target.timer_id, TimerAction::Cancel).await,
            ClientMessage::Update(update) => self.update(update).await,
            ClientMessage::Delete(target) => {
                let timer_id = parse_timer_id(&target.timer_id)?;
                delete_timer(&self.app_state, self.owner_id, timer_id).await?;
                Ok(ServerMessage::TimerDeleted { timer_id })
            }
            ClientMessage::Sync(request) => {
                let timers =
                    load_snapshot(self.app_state.store.as_ref(), self.owner_id, request.scope).await?;
                Ok(ServerMessage::sync_result(&timers))
            }
        }
    }

    async fn create(&self, create: CreateTimer) -> Result<ServerMessage, GatewayError> {
        let now = self.app_state.clock.now();
        let draft = TimerDraft {
            title: create.title,
            description: create.description,
            allocated_duration: create.allocated_duration,
            schedule_id: create.schedule_id,
            todo_id: create.todo_id,
        };
        let mut timer = state::create(self.owner_id, draft, now)?;
        if create.autostart {
            timer = state::start(&timer, now)?;
        }

        let saved = self.app_state.store.insert(timer).await?;
        info!(owner_id = %self.owner_id, timer_id = %saved.id, status = %saved.status, "Timer created");
        Ok(self.publish("create", &saved))
    }

    async fn transition(&self, raw_id: &str, action: TimerAction) -> Result<ServerMessage, GatewayError> {
        let timer_id = parse_timer_id(raw_id)?;
        // Read the clock under the store's per-timer lock, so racing writers
        // apply their instants in the order they commit.
        let clock = self.app_state.clock.clone();
        let saved = self
            .app_state
            .store
            .update(
                timer_id,
                self.owner_id,
                Box::new(move |current: &TimerSession| state::apply(current, action, clock.now())),
            )
            .await?;
        info!(
            owner_id = %self.owner_id,
            %timer_id,
            %action,
            elapsed_time = saved.elapsed_time,
            "Timer transition applied"
        );
        Ok(self.publish(action.as_str(), &saved))
    }

    async fn update(&self, update: UpdateTimer) -> Result<ServerMessage, GatewayError> {
        let timer_id = parse_timer_id(&update.timer_id)?;
        let patch = TimerPatch {
            title: update.title,
            description: update.description,
            allocated_duration: update.allocated_duration,
        };
        let clock = self.app_state.clock.clone();
        let saved = self
            .app_state
            .store
            .update(
                timer_id,
                self.owner_id,
                Box::new(move |current: &TimerSession| {
                    state::update_fields(current, patch, clock.now())
                }),
            )
            .await?;
        info!(owner_id = %self.owner_id, %timer_id, "Timer fields updated");
        Ok(self.publish("update", &saved))
    }

    /// Broadcasts the persisted timer to every connection of the owner and
    /// builds the direct acknowledgement from the same value.
    fn publish(&self, action: &str, saved: &TimerSession) -> ServerMessage {
        self.app_state.broadcaster.broadcast_timer(self.owner_id, saved);
        ServerMessage::Ack {
            action: action.to_string(),
            timer: TimerView::from(saved),
        }
    }
}

/// Ids that don't parse can't name any timer.
fn parse_timer_id(raw: &str) -> Result<Uuid, GatewayError> {
    Uuid::parse_str(raw).map_err(|_| GatewayError::not_found(format!("Timer {} not found", raw)))
}

/// The owner's timers matching `scope`, oldest first.
pub async fn load_snapshot(
    store: &dyn TimerStore,
    owner_id: Uuid,
    scope: SyncScope,
) -> Result<Vec<TimerSession>, GatewayError> {
    let timers = match scope {
        SyncScope::Active => store.list_active(owner_id).await?,
        SyncScope::All => store.list_all(owner_id).await?,
    };
    Ok(timers)
}

/// Deletes a timer and tells every connection of the owner. Shared by the
/// WebSocket command and the REST endpoint.
pub async fn delete_timer(
    app_state: &AppState,
    owner_id: Uuid,
    timer_id: Uuid,
) -> Result<(), GatewayError> {
    app_state.store.delete(timer_id, owner_id).await?;
    app_state.broadcaster.broadcast_deleted(owner_id, timer_id);
    info!(%owner_id, %timer_id, "Timer deleted");
    Ok(())
}
