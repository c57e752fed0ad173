pub mod broadcaster;
pub mod gateway;
pub mod middleware;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod state;
pub mod ws_handler;

// Re-export the handlers to make them easily accessible
// to the binary that builds the web server router.
pub use middleware::require_user;
pub use rest::{delete_timer_handler, list_timers_handler};
pub use ws_handler::ws_handler;
