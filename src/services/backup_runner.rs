use crate::error::AppError;
use crate::models::backup::{
    self, generate_backup_id, BackupKind, BackupRecord, BackupStatus, NewBackup,
};
use crate::models::settings::Settings;
use crate::services::encryption::EncryptionEnvelope;
use crate::services::event_log::{self, LogContext};
use crate::services::mongo_tools;
use crate::services::oplog::{self, OplogTimestamp};
use crate::services::retention;
use crate::services::transport::Transport;
use crate::state::{AppState, CurrentBackup};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

/// Claim the backup gate and start a backup in the background. Returns
/// the in_progress record immediately; a concurrent backup (either kind)
/// is rejected, never queued.
pub async fn start_backup(
    state: Arc<AppState>,
    kind: BackupKind,
) -> Result<BackupRecord, AppError> {
    let permit = state
        .backup_gate
        .clone()
        .try_acquire_owned()
        .map_err(|_| AppError::AlreadyInProgress("backup"))?;

    let db = state.db.clone();
    let prepared = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        let settings = Settings::load(&conn)?;
        if settings.mongo_url.is_empty() {
            return Err(AppError::Config("MongoDB URL not configured".into()));
        }

        // An incremental is an oplog slice since the previous backup; it
        // needs a cursor to slice from and a completed full to chain to.
        let plan = match kind {
            BackupKind::Full => IncrementalPlan::NotApplicable,
            BackupKind::Incremental => {
                let previous = backup::find_last_completed(&conn)?.ok_or_else(|| {
                    AppError::Config(
                        "No completed backup found. Run a full backup first.".into(),
                    )
                })?;
                let base = backup::find_latest_full_completed(&conn)?.ok_or_else(|| {
                    AppError::Config(
                        "No completed full backup found. Run a full backup first.".into(),
                    )
                })?;
                let since = previous
                    .oplog_end_ts
                    .map(OplogTimestamp::from_packed)
                    .unwrap_or_else(|| OplogTimestamp::from_wall_clock_ms(previous.timestamp));
                IncrementalPlan::SliceAfter {
                    since,
                    base_id: base.id,
                }
            }
        };

        let now = chrono::Utc::now();
        let filename = format!(
            "{}_{}.archive.gz",
            kind.as_str(),
            now.format("%Y%m%d_%H%M%S")
        );
        Ok::<_, AppError>((settings, plan, filename, now.timestamp_millis()))
    })
    .await
    .map_err(anyhow::Error::from)??;
    let (settings, plan, filename, timestamp) = prepared;

    let local_path = state.config.backups_dir.join(&filename);
    let db = state.db.clone();
    let new = NewBackup {
        id: generate_backup_id(),
        filename,
        kind,
        timestamp,
        local_path: local_path.to_string_lossy().into_owned(),
        base_backup_id: match &plan {
            IncrementalPlan::SliceAfter { base_id, .. } => Some(base_id.clone()),
            IncrementalPlan::NotApplicable => None,
        },
    };
    let record = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::create(&conn, &new)
    })
    .await
    .map_err(anyhow::Error::from)??;

    *state.current_backup.lock().await = Some(CurrentBackup {
        id: record.id.clone(),
        kind,
        started_at: timestamp,
    });
    event_log::info(
        &state.db,
        &format!("{} backup started: {}", kind.as_str(), record.id),
        LogContext::backup(&record.id),
    );

    let driver_record = record.clone();
    tokio::spawn(drive_backup(state, settings, driver_record, plan, permit));
    Ok(record)
}

enum IncrementalPlan {
    NotApplicable,
    SliceAfter {
        since: OplogTimestamp,
        base_id: String,
    },
}

async fn drive_backup(
    state: Arc<AppState>,
    settings: Settings,
    record: BackupRecord,
    plan: IncrementalPlan,
    _permit: OwnedSemaphorePermit,
) {
    let result = match plan {
        IncrementalPlan::NotApplicable => run_full(&state, &settings, &record).await,
        IncrementalPlan::SliceAfter { since, .. } => {
            run_incremental(&state, &settings, &record, since).await
        }
    };

    if let Err(e) = result {
        let msg = format!("{:#}", e);
        event_log::error(
            &state.db,
            &format!("Backup {} failed: {}", record.id, msg),
            LogContext::backup(&record.id),
        );
        let db = state.db.clone();
        let id = record.id.clone();
        let res = tokio::task::spawn_blocking(move || {
            let conn = db.get().map_err(anyhow::Error::from)?;
            backup::mark_failed(&conn, &id, &msg)
        })
        .await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(backup_id = %record.id, "Failed to record backup failure: {:#}", e)
            }
            Err(e) => {
                tracing::error!(backup_id = %record.id, "Failed to record backup failure: {}", e)
            }
        }
    }

    *state.current_backup.lock().await = None;
    // Permit drops here, releasing the gate.
}

async fn run_full(
    state: &Arc<AppState>,
    settings: &Settings,
    record: &BackupRecord,
) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(state.config.tool_timeout_secs);
    let local_path = PathBuf::from(
        record
            .local_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Backup record has no local path"))?,
    );
    tokio::fs::create_dir_all(&state.config.backups_dir).await?;

    if settings.enable_encryption {
        let raw_path = local_path.with_extension("raw");
        let dump_result = mongo_tools::dump_full(&settings.mongo_url, &raw_path, timeout).await;
        if let Err(e) = dump_result {
            let _ = tokio::fs::remove_file(&raw_path).await;
            return Err(e);
        }
        let envelope = EncryptionEnvelope::new(&settings.encryption_key)?;
        let wrap_raw = raw_path.clone();
        let wrap_out = local_path.clone();
        let wrap_result =
            tokio::task::spawn_blocking(move || envelope.wrap_file(&wrap_raw, &wrap_out)).await?;
        let _ = tokio::fs::remove_file(&raw_path).await;
        wrap_result?;
    } else {
        mongo_tools::dump_full(&settings.mongo_url, &local_path, timeout).await?;
    }

    finalize_artifact(state, settings, record, &local_path, None).await
}

async fn run_incremental(
    state: &Arc<AppState>,
    settings: &Settings,
    record: &BackupRecord,
    since: OplogTimestamp,
) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(state.config.tool_timeout_secs);
    let local_path = PathBuf::from(
        record
            .local_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Backup record has no local path"))?,
    );
    tokio::fs::create_dir_all(&state.config.backups_dir).await?;

    let capture_path = if settings.enable_encryption {
        local_path.with_extension("raw")
    } else {
        local_path.clone()
    };
    let captured =
        oplog::capture_slice(&settings.mongo_url, since, &capture_path, timeout).await?;

    // An empty slice is not a failure: nothing happened since the last
    // backup. The record flips to skipped and no artifact is kept.
    if captured.is_none() {
        let db = state.db.clone();
        let id = record.id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup::mark_skipped(&conn, &id, "No new operations since last backup")
        })
        .await??;
        event_log::info(
            &state.db,
            &format!(
                "Incremental backup {} skipped: no new operations",
                record.id
            ),
            LogContext::backup(&record.id),
        );
        return Ok(());
    }

    if settings.enable_encryption {
        let envelope = EncryptionEnvelope::new(&settings.encryption_key)?;
        let wrap_raw = capture_path.clone();
        let wrap_out = local_path.clone();
        let wrap_result =
            tokio::task::spawn_blocking(move || envelope.wrap_file(&wrap_raw, &wrap_out)).await?;
        let _ = tokio::fs::remove_file(&capture_path).await;
        wrap_result?;
    }

    finalize_artifact(state, settings, record, &local_path, Some(since)).await
}

/// Shared tail of both backup kinds: record the size and exact oplog
/// window, upload offsite, apply local-copy policy, run retention.
async fn finalize_artifact(
    state: &Arc<AppState>,
    settings: &Settings,
    record: &BackupRecord,
    local_path: &std::path::Path,
    slice_start: Option<OplogTimestamp>,
) -> anyhow::Result<()> {
    let size = tokio::fs::metadata(local_path).await?.len() as i64;

    // Top of the replication log right after the dump: the next
    // incremental slices from this exact position. Best effort; the
    // wall-clock fallback covers a missing cursor.
    let end_ts = match oplog::latest_oplog_timestamp(&settings.mongo_url).await {
        Ok(ts) => ts,
        Err(e) => {
            tracing::warn!(backup_id = %record.id, "Could not read oplog head: {}", e);
            None
        }
    };

    let mut upload_error: Option<String> = None;
    let mut remote_path: Option<String> = None;
    if let Some(transport) = Transport::from_settings(settings) {
        let remote_key = Transport::remote_key_for(&record.filename);
        match transport.put(local_path, &remote_key).await {
            Ok(uploaded) => remote_path = Some(uploaded.remote_key),
            Err(e) => upload_error = Some(format!("{:#}", e)),
        }
    }

    let status = if upload_error.is_some() {
        BackupStatus::UploadFailed
    } else {
        BackupStatus::Completed
    };

    // Discard the local copy only when an offsite copy exists.
    let mut local_path_field = Some(local_path.to_string_lossy().into_owned());
    if !settings.keep_local_backups && remote_path.is_some() {
        if let Err(e) = tokio::fs::remove_file(local_path).await {
            tracing::warn!(backup_id = %record.id, "Failed to remove local copy: {}", e);
        } else {
            local_path_field = None;
        }
    }

    let db = state.db.clone();
    let id = record.id.clone();
    let encrypted = settings.enable_encryption;
    let completed_at = chrono::Utc::now().timestamp_millis();
    let remote_path_db = remote_path.clone();
    let error_db = upload_error.clone();
    let start_packed = slice_start.map(|ts| ts.packed());
    let end_packed = end_ts.map(|ts| ts.packed());
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::update_fields(&conn, &id, &[
            ("status", &status.as_str() as &dyn rusqlite::types::ToSql),
            ("size", &size),
            ("local_path", &local_path_field),
            ("remote_path", &remote_path_db),
            ("encrypted", &(encrypted as i64)),
            ("error", &error_db),
            ("completed_at", &completed_at),
            ("oplog_start_ts", &start_packed),
            ("oplog_end_ts", &end_packed),
        ])
    })
    .await??;

    match &upload_error {
        Some(e) => event_log::warning(
            &state.db,
            &format!(
                "Backup {} completed locally but offsite upload failed: {}",
                record.id, e
            ),
            LogContext::backup(&record.id),
        ),
        None => event_log::success(
            &state.db,
            &format!(
                "{} backup completed: {} ({} bytes)",
                record.kind.as_str(),
                record.id,
                size
            ),
            LogContext::backup(&record.id)
                .with_details(serde_json::json!({ "size": size, "remote": remote_path })),
        ),
    }

    if let Err(e) = retention::apply_retention(state).await {
        tracing::warn!("Retention sweep after backup failed: {:#}", e);
    }
    Ok(())
}
