use crate::error::AppError;
use crate::models::log_entry::{self, LogPage, LogQuery};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_logs).delete(clear_logs))
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<LogPage>, AppError> {
    let db = state.db.clone();
    let page = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        log_entry::query(&conn, &query)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(page))
}

#[derive(serde::Deserialize)]
pub struct ClearQuery {
    /// When set, only entries older than this many days are purged.
    pub older_than_days: Option<i64>,
}

async fn clear_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let deleted = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        match query.older_than_days {
            Some(days) => {
                let cutoff =
                    chrono::Utc::now().timestamp_millis() - days.max(0) * 24 * 60 * 60 * 1000;
                log_entry::delete_older_than(&conn, cutoff)
            }
            None => log_entry::delete_all(&conn),
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(json!({ "deleted": deleted })))
}
