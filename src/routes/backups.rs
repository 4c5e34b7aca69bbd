use crate::error::AppError;
use crate::models::backup::{self, BackupKind, BackupRecord, BackupStatus};
use crate::services::chain::{self, RestoreChain};
use crate::services::{backup_runner, retention};
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
        .route("/", get(list_backups))
        .route("/status", get(backup_status))
        .route("/stats", get(backup_stats))
        .route("/pitr-status", get(pitr_status))
        .route("/chain/{timestamp}", get(preview_chain))
        .route("/run", post(run_backup))
        .route("/{id}", get(get_backup).delete(delete_backup))
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BackupRecord>>, AppError> {
    let db = state.db.clone();
    let backups = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_all(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(backups))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRecord>, AppError> {
    let db = state.db.clone();
    let record = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_by_id(&conn, &id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    match record {
        Some(r) => Ok(Json(r)),
        None => Err(AppError::NotFound("Backup not found".into())),
    }
}

async fn backup_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let current = state.current_backup.lock().await.clone();
    let db = state.db.clone();
    let last_completed = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_last_completed(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(json!({
        "running": current.is_some(),
        "current": current,
        "last_completed": last_completed,
    })))
}

#[derive(Deserialize)]
pub struct RunBackupRequest {
    pub kind: BackupKind,
}

async fn run_backup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RunBackupRequest>,
) -> Result<(StatusCode, Json<BackupRecord>), AppError> {
    let record = backup_runner::start_backup(state, req.kind).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let lookup_id = id.clone();
    let record = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_by_id(&conn, &lookup_id)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    let record = record.ok_or_else(|| AppError::NotFound("Backup not found".into()))?;
    if record.status == BackupStatus::InProgress {
        return Err(AppError::BadRequest(
            "Cannot delete a backup that is in progress".into(),
        ));
    }

    let outcome = retention::delete_backup(&state, &id).await?;
    let status = match outcome {
        retention::DeleteOutcome::Deleted => "deleted",
        retention::DeleteOutcome::Pending => "deletion_pending",
    };
    Ok(Json(json!({ "id": id, "status": status })))
}

async fn preview_chain(
    State(state): State<Arc<AppState>>,
    Path(timestamp): Path<i64>,
) -> Result<Json<RestoreChain>, AppError> {
    let db = state.db.clone();
    let resolved = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        chain::resolve_chain(&conn, timestamp).map_err(AppError::from)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(resolved))
}

async fn backup_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let backups = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_all(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let completed: Vec<&BackupRecord> = backups
        .iter()
        .filter(|b| b.status == BackupStatus::Completed)
        .collect();
    let total_size: i64 = completed.iter().map(|b| b.size).sum();
    let last_backup_at = completed.iter().map(|b| b.timestamp).max();
    let last_full_at = completed
        .iter()
        .filter(|b| b.kind == BackupKind::Full)
        .map(|b| b.timestamp)
        .max();

    Ok(Json(json!({
        "total": backups.len(),
        "completed": completed.len(),
        "failed": backups.iter().filter(|b| b.status == BackupStatus::Failed).count(),
        "skipped": backups.iter().filter(|b| b.status == BackupStatus::Skipped).count(),
        "full": completed.iter().filter(|b| b.kind == BackupKind::Full).count(),
        "incremental": completed.iter().filter(|b| b.kind == BackupKind::Incremental).count(),
        "total_size": total_size,
        "last_backup_at": last_backup_at,
        "last_full_at": last_full_at,
    })))
}

/// Point-in-time readiness: the window `[latest full, newest completed
/// backup]` is restorable to any instant inside it.
async fn pitr_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let (settings, base, last) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let settings = crate::models::settings::Settings::load(&conn)?;
        let base = backup::find_latest_full_completed(&conn)?;
        let last = backup::find_last_completed(&conn)?;
        Ok::<_, anyhow::Error>((settings, base, last))
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let Some(base) = base else {
        return Ok(Json(json!({
            "available": false,
            "reason": "No completed full backup",
            "schedule_enabled": settings.schedule_enabled,
        })));
    };

    let db = state.db.clone();
    let base_ts = base.timestamp;
    let incrementals = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_incrementals_between(&conn, base_ts, i64::MAX)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    let restorable_from = base.timestamp;
    let restorable_to = last.map(|b| b.timestamp).unwrap_or(restorable_from);
    Ok(Json(json!({
        "available": true,
        "schedule_enabled": settings.schedule_enabled,
        "base": base,
        "incremental_count": incrementals.len(),
        "restorable_from": restorable_from,
        "restorable_to": restorable_to,
    })))
}
