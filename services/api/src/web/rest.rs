//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST endpoints and the master
//! definition for the OpenAPI specification. These are pass-throughs for
//! clients that want a snapshot without opening a WebSocket.

use crate::web::{
    gateway::{delete_timer, load_snapshot},
    protocol::{ErrorCode, GatewayError, SyncScope, TimerView},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        list_timers_handler,
        delete_timer_handler,
    ),
    components(
        schemas(TimerView, SyncScope)
    ),
    tags(
        (name = "Timer API", description = "Snapshot and deletion endpoints for timer sessions. Live updates are served over /ws.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// Request Structs
//=========================================================================================

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListTimersQuery {
    /// `active` (default) or `all`.
    #[serde(default)]
    #[param(inline)]
    pub scope: SyncScope,
}

fn status_for(e: GatewayError) -> (StatusCode, String) {
    let status = match e.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => {
            error!("Timer store failure: {}", e.message);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        _ => StatusCode::BAD_REQUEST,
    };
    (status, e.message)
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// List the caller's timers.
#[utoipa::path(
    get,
    path = "/timers",
    params(ListTimersQuery),
    responses(
        (status = 200, description = "Timers matching the scope, oldest first", body = [TimerView]),
        (status = 401, description = "Missing or invalid user id"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn list_timers_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Query(query): Query<ListTimersQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let timers = load_snapshot(app_state.store.as_ref(), user_id, query.scope)
        .await
        .map_err(status_for)?;
    let views: Vec<TimerView> = timers.iter().map(TimerView::from).collect();
    Ok(Json(views))
}

/// Delete one of the caller's timers. Connected clients receive `timer.deleted`.
#[utoipa::path(
    delete,
    path = "/timers/{timer_id}",
    params(
        ("timer_id" = Uuid, Path, description = "The timer to delete.")
    ),
    responses(
        (status = 204, description = "Timer deleted"),
        (status = 401, description = "Missing or invalid user id"),
        (status = 404, description = "No such timer for this user"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn delete_timer_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(user_id): Extension<Uuid>,
    Path(timer_id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    delete_timer(&app_state, user_id, timer_id)
        .await
        .map_err(status_for)?;
    Ok(StatusCode::NO_CONTENT)
}
