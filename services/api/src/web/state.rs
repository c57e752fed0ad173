//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use crate::web::{broadcaster::SyncBroadcaster, registry::ConnectionRegistry};
use std::sync::Arc;
use timer_core::clock::Clock;
use timer_core::ports::TimerStore;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TimerStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: SyncBroadcaster,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires a fresh connection registry and its broadcaster around `store`.
    pub fn new(store: Arc<dyn TimerStore>, clock: Arc<dyn Clock>, config: Arc<Config>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            store,
            broadcaster: SyncBroadcaster::new(registry.clone()),
            registry,
            clock,
            config,
        }
    }
}
