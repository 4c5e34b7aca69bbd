use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let db = state.db.clone();
    let db_ok = tokio::task::spawn_blocking(move || db.get().is_ok())
        .await
        .unwrap_or(false);
    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "db": db_ok,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
