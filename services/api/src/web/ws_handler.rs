//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point and control loop for a timer WebSocket connection.
//! The socket is split: this task reads frames and feeds them to the connection's
//! `SessionGateway`, while a writer task drains the connection's outbound queue
//! (direct replies and broadcasts alike) into the socket.

use crate::web::{
    gateway::SessionGateway,
    protocol::{ErrorCode, GatewayError, ServerMessage},
    registry::ConnectionHandle,
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user_id))
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, user_id: Uuid) {
    info!("New WebSocket connection established for user: {}", user_id);

    let (sender, mut receiver) = socket.split();
    let (connection, outbound) = ConnectionHandle::channel();
    let gateway = SessionGateway::new(app_state, user_id, connection);

    let shutdown = CancellationToken::new();
    let writer = tokio::spawn(write_outbound(sender, outbound, shutdown.clone()));

    // --- 1. Registration, `connected` and the initial snapshot ---
    gateway.on_connect().await;

    // --- 2. Main Message Loop ---
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => gateway.handle_text(text.as_str()).await,
            Some(Ok(Message::Binary(_))) => gateway.reply(
                GatewayError::new(ErrorCode::ParseError, "Binary frames are not supported")
                    .into_message(),
            ),
            Some(Ok(Message::Close(_))) => {
                info!("Client sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket read failed: {}", e);
                break;
            }
            None => {
                info!("Client disconnected.");
                break;
            }
        }
    }

    // --- 3. Cleanup ---
    // Timers outlive the connection; only the registration goes away.
    gateway.on_disconnect();
    shutdown.cancel();
    if let Err(e) = writer.await {
        error!("Writer task for connection {} failed: {:?}", gateway.connection_id(), e);
    }
    info!("WebSocket connection closed.");
}

/// Forwards queued messages to the socket until the connection shuts down or
/// the socket stops accepting writes.
async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<ServerMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {} message: {}", message.kind(), e);
                continue;
            }
        };
        if sender.send(Message::Text(json.into())).await.is_err() {
            warn!("Failed to send {} message, closing writer.", message.kind());
            break;
        }
    }
    let _ = sender.close().await;
}
