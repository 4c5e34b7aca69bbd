use crate::error::AppError;
use crate::services::restore;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(restore_status))
        .route("/point-in-time", post(point_in_time))
        .route("/{id}", post(restore_backup))
}

async fn restore_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let progress = state.restore_progress.lock().await.clone();
    Json(json!({ "progress": progress }))
}

#[derive(Deserialize)]
pub struct PointInTimeRequest {
    pub target_timestamp: i64,
}

async fn point_in_time(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PointInTimeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if req.target_timestamp <= 0 {
        return Err(AppError::BadRequest("Invalid target timestamp".into()));
    }
    let resolved = restore::start_point_in_time_restore(state, req.target_timestamp).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "target_timestamp": req.target_timestamp,
            "steps": resolved.len(),
            "base_backup_id": resolved.base_full.id,
            "estimated_size": resolved.total_estimated_size,
        })),
    ))
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let resolved = restore::start_restore_backup(state, &id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "backup_id": id,
            "steps": resolved.len(),
            "base_backup_id": resolved.base_full.id,
            "estimated_size": resolved.total_estimated_size,
        })),
    ))
}
