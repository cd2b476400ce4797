//! Admin HTTP API.

pub mod error;
mod services;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the admin router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(services::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
