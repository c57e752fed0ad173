//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, MemoryTimerStore},
    config::Config,
    error::ApiError,
    web::{
        delete_timer_handler, list_timers_handler, require_user, rest::ApiDoc, state::AppState,
        ws_handler,
    },
};
use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderName, HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{delete, get},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use timer_core::{clock::Clock, ports::TimerStore, SystemClock};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Select the Timer Store ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn TimerStore> = match config.database_url.as_deref() {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(database_url)
                .await?;
            let db_adapter = DbAdapter::new(db_pool, clock.clone());
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        None => {
            warn!("DATABASE_URL is not set; timers are kept in memory and lost on restart.");
            Arc::new(MemoryTimerStore::new(clock.clone()))
        }
    };

    // --- 3. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(store, clock, config.clone()));

    let cors_origin = config
        .cors_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid CORS origin '{}': {}", config.cors_origin, e)))?;
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static(api_lib::web::middleware::USER_ID_HEADER),
        ]);

    // --- 4. Create the Web Router ---
    // Every route needs a resolved user id.
    let protected_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/timers", get(list_timers_handler))
        .route("/timers/{timer_id}", delete(delete_timer_handler))
        .layer(axum_middleware::from_fn(require_user));

    let api_router = Router::new()
        .merge(protected_routes)
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 5. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
