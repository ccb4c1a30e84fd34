//! sikreg-backend: stub registration backend
//!
//! Answers the two endpoints the client talks to:
//! - `/auth.php` allocates a stream URL per section
//! - `/check.php` reports the test stream as seen after a few checks

pub mod handlers;
pub mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use sikreg_core::config::ServerConfig;
use sikreg_core::protocol::{AUTH_PATH, CHECK_PATH};

pub use handlers::SharedState;
pub use state::BackendState;

/// Shared state built from the `[server]` config section
pub fn shared_state(config: &ServerConfig) -> SharedState {
    Arc::new(RwLock::new(BackendState::from_config(config)))
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(AUTH_PATH, post(handlers::auth_handler))
        .route(CHECK_PATH, post(handlers::check_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
