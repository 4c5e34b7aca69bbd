use crate::error::AppError;
use crate::models::settings::Settings;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_settings).post(update_settings))
}

async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let settings = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        Settings::load(&conn)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    // The key itself never leaves the server.
    let key_set = !settings.encryption_key.is_empty();
    let mut body = serde_json::to_value(&settings).map_err(anyhow::Error::from)?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("encryption_key_set".into(), json!(key_set));
    }
    Ok(Json(body))
}

/// Partial update: absent fields keep their stored values.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub mongo_url: Option<String>,
    pub keep_local_backups: Option<bool>,
    pub keep_last_n_backups: Option<i64>,
    pub retention_days: Option<i64>,
    pub full_backup_cron: Option<String>,
    pub incremental_backup_cron: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub enable_encryption: Option<bool>,
    pub encryption_key: Option<String>,
    pub remote_enabled: Option<bool>,
    pub remote_dir: Option<String>,
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(n) = update.keep_last_n_backups {
        if n < 1 {
            return Err(AppError::BadRequest("keep_last_n_backups must be at least 1".into()));
        }
    }
    if let Some(d) = update.retention_days {
        if d < 1 {
            return Err(AppError::BadRequest("retention_days must be at least 1".into()));
        }
    }
    if update.enable_encryption == Some(true) {
        if let Some(key) = &update.encryption_key {
            if key.is_empty() {
                return Err(AppError::BadRequest(
                    "Cannot enable encryption with an empty key".into(),
                ));
            }
        }
    }

    let db = state.db.clone();
    let settings = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        let mut s = Settings::load(&conn)?;
        if let Some(v) = update.mongo_url {
            s.mongo_url = v;
        }
        if let Some(v) = update.keep_local_backups {
            s.keep_local_backups = v;
        }
        if let Some(v) = update.keep_last_n_backups {
            s.keep_last_n_backups = v;
        }
        if let Some(v) = update.retention_days {
            s.retention_days = v;
        }
        if let Some(v) = update.full_backup_cron {
            s.full_backup_cron = v;
        }
        if let Some(v) = update.incremental_backup_cron {
            s.incremental_backup_cron = v;
        }
        if let Some(v) = update.schedule_enabled {
            s.schedule_enabled = v;
        }
        if let Some(v) = update.enable_encryption {
            s.enable_encryption = v;
        }
        if let Some(v) = update.encryption_key {
            if !v.is_empty() {
                s.encryption_key = v;
            }
        }
        if let Some(v) = update.remote_enabled {
            s.remote_enabled = v;
        }
        if let Some(v) = update.remote_dir {
            s.remote_dir = v;
        }
        if s.enable_encryption && s.encryption_key.is_empty() {
            return Err(AppError::BadRequest(
                "Cannot enable encryption without an encryption key".into(),
            ));
        }
        s.save(&conn)?;
        Ok::<_, AppError>(s)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    // Cron changes take effect immediately.
    if let Some(scheduler) = state.scheduler.get() {
        if let Err(e) = scheduler.apply_settings(&settings).await {
            return Err(AppError::BadRequest(format!(
                "Settings saved but schedule could not be applied: {}",
                e
            )));
        }
    }

    Ok(Json(json!({ "updated": true })))
}
