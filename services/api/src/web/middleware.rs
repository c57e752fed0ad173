//! services/api/src/web/middleware.rs
//!
//! Identity middleware for protecting routes.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use tracing::warn;
use uuid::Uuid;

/// Header set by the identity layer in front of this service.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the caller's user id and inserts it into the request extensions.
///
/// The id comes from the `x-user-id` header, or from a `user_id` query
/// parameter for browser WebSocket clients, which cannot set headers.
/// Missing or malformed ids are rejected with 401 Unauthorized.
pub async fn require_user(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let from_header = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("user_id="))
            .map(str::to_string)
    });

    let raw = from_header.or(from_query).ok_or(StatusCode::UNAUTHORIZED)?;
    let user_id = Uuid::parse_str(raw.trim()).map_err(|_| {
        warn!("Rejected request with malformed user id: {}", raw);
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(user_id);
    Ok(next.run(req).await)
}
