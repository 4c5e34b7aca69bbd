pub mod backups;
pub mod health;
pub mod logs;
pub mod restore;
pub mod settings;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/health", health::router(state.clone()))
        .nest("/api/backups", backups::router(state.clone()))
        .nest("/api/restore", restore::router(state.clone()))
        .nest("/api/logs", logs::router(state.clone()))
        .nest("/api/settings", settings::router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
