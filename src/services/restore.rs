use crate::error::AppError;
use crate::models::backup::{self, BackupKind, BackupRecord};
use crate::models::settings::Settings;
use crate::services::chain::{self, RestoreChain};
use crate::services::encryption::EncryptionEnvelope;
use crate::services::event_log::{self, LogContext};
use crate::services::mongo_tools;
use crate::services::oplog;
use crate::services::transport::Transport;
use crate::state::{AppState, RestoreProgress, RestoreState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

/// Restore the target database to a point in time: full base restore,
/// then ascending oplog replay of every incremental in the chain.
/// Resolution errors (no usable base) surface immediately; execution
/// happens in the background behind the restore gate.
pub async fn start_point_in_time_restore(
    state: Arc<AppState>,
    target_ms: i64,
) -> Result<RestoreChain, AppError> {
    let permit = claim_gate(&state)?;

    let db = state.db.clone();
    let (settings, resolved) = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        let settings = Settings::load(&conn)?;
        if settings.mongo_url.is_empty() {
            return Err(AppError::Config("MongoDB URL not configured".into()));
        }
        let resolved = chain::resolve_chain(&conn, target_ms)?;
        Ok::<_, AppError>((settings, resolved))
    })
    .await
    .map_err(anyhow::Error::from)??;

    begin(
        state,
        settings,
        resolved.clone(),
        Some(target_ms),
        None,
        permit,
    )
    .await;
    Ok(resolved)
}

/// Restore a single backup by id: a full restores alone, an incremental
/// pulls in its base full and every intervening incremental.
pub async fn start_restore_backup(
    state: Arc<AppState>,
    backup_id: &str,
) -> Result<RestoreChain, AppError> {
    let permit = claim_gate(&state)?;

    let db = state.db.clone();
    let id = backup_id.to_string();
    let (settings, resolved, target_id) = tokio::task::spawn_blocking(move || {
        let conn = db.get().map_err(anyhow::Error::from)?;
        let settings = Settings::load(&conn)?;
        if settings.mongo_url.is_empty() {
            return Err(AppError::Config("MongoDB URL not configured".into()));
        }
        let target = backup::find_by_id(&conn, &id)?
            .ok_or_else(|| AppError::NotFound(format!("Backup not found: {}", id)))?;
        if target.status != crate::models::backup::BackupStatus::Completed {
            return Err(AppError::BadRequest(format!(
                "Backup {} is not completed and cannot be restored",
                id
            )));
        }
        let resolved = chain::resolve_chain_for_backup(&conn, &target)?;
        Ok::<_, AppError>((settings, resolved, target.id))
    })
    .await
    .map_err(anyhow::Error::from)??;

    begin(state, settings, resolved.clone(), None, Some(target_id), permit).await;
    Ok(resolved)
}

fn claim_gate(state: &Arc<AppState>) -> Result<OwnedSemaphorePermit, AppError> {
    state
        .restore_gate
        .clone()
        .try_acquire_owned()
        .map_err(|_| AppError::AlreadyInProgress("restore"))
}

async fn begin(
    state: Arc<AppState>,
    settings: Settings,
    resolved: RestoreChain,
    target_ms: Option<i64>,
    target_backup_id: Option<String>,
    permit: OwnedSemaphorePermit,
) {
    *state.restore_progress.lock().await = Some(RestoreProgress {
        target_timestamp: target_ms,
        target_backup_id: target_backup_id.clone(),
        total_steps: resolved.len(),
        current_step: 0,
        state: RestoreState::InProgress,
        partially_restored_at_step: None,
        error: None,
    });
    event_log::info(
        &state.db,
        &format!(
            "Restore started: {} step(s), base {}",
            resolved.len(),
            resolved.base_full.id
        ),
        LogContext::backup(&resolved.base_full.id),
    );

    tokio::spawn(drive_restore(state, settings, resolved, permit));
}

async fn drive_restore(
    state: Arc<AppState>,
    settings: Settings,
    resolved: RestoreChain,
    _permit: OwnedSemaphorePermit,
) {
    let mut mutation_started = false;
    let mut failed_at: Option<usize> = None;
    let mut failure: Option<anyhow::Error> = None;

    let members: Vec<BackupRecord> = resolved.members().into_iter().cloned().collect();
    for (index, member) in members.iter().enumerate() {
        let step = index + 1;
        if let Some(progress) = state.restore_progress.lock().await.as_mut() {
            progress.current_step = step;
        }

        match apply_member(&state, &settings, member, &mut mutation_started).await {
            Ok(()) => {}
            Err(e) => {
                failed_at = Some(step);
                failure = Some(e);
                break;
            }
        }
    }

    match failure {
        None => {
            if let Some(progress) = state.restore_progress.lock().await.as_mut() {
                progress.state = RestoreState::Completed;
            }
            event_log::success(
                &state.db,
                &format!("Restore completed: {} step(s) applied", members.len()),
                LogContext::default(),
            );
        }
        Some(e) => {
            let step = failed_at.unwrap_or(0);
            // Once the base restore or any replay has touched the target,
            // a failure leaves it between backups. That state is reported,
            // not rolled back.
            let partial = mutation_started.then_some(step);
            let msg = format!("{:#}", e);
            if let Some(progress) = state.restore_progress.lock().await.as_mut() {
                progress.state = RestoreState::Failed;
                progress.partially_restored_at_step = partial;
                progress.error = Some(msg.clone());
            }
            event_log::error(
                &state.db,
                &format!(
                    "Restore failed at step {}/{}: {}{}",
                    step,
                    members.len(),
                    msg,
                    if partial.is_some() {
                        " (target database is partially restored)"
                    } else {
                        ""
                    }
                ),
                LogContext::default(),
            );
        }
    }
    // Permit drops here, releasing the gate.
}

async fn apply_member(
    state: &Arc<AppState>,
    settings: &Settings,
    member: &BackupRecord,
    mutation_started: &mut bool,
) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(state.config.tool_timeout_secs);
    let staged = stage_artifact(state, settings, member).await?;

    let result = match member.kind {
        BackupKind::Full => {
            *mutation_started = true;
            mongo_tools::restore_full(&settings.mongo_url, &staged.path, timeout).await
        }
        BackupKind::Incremental => {
            *mutation_started = true;
            oplog::apply_slice(&state.db, &settings.mongo_url, &staged.path, timeout)
                .await
                .map(|stats| {
                    event_log::info(
                        &state.db,
                        &format!(
                            "Replayed {}: {} applied, {} skipped, {} errors",
                            member.id, stats.applied, stats.skipped, stats.errors
                        ),
                        LogContext::backup(&member.id),
                    );
                })
        }
    };

    staged.cleanup().await;
    result
}

struct StagedArtifact {
    path: PathBuf,
    temps: Vec<PathBuf>,
}

impl StagedArtifact {
    async fn cleanup(self) {
        for temp in &self.temps {
            if let Err(e) = tokio::fs::remove_file(temp).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %temp.display(), "Failed to remove restore temp file: {}", e);
                }
            }
        }
    }
}

/// Make the member's archive available as a plaintext local file: the
/// local copy when it still exists, the offsite copy otherwise, with the
/// encryption envelope stripped when present.
async fn stage_artifact(
    state: &Arc<AppState>,
    settings: &Settings,
    member: &BackupRecord,
) -> anyhow::Result<StagedArtifact> {
    let mut temps = Vec::new();

    let source = match &member.local_path {
        Some(p) if tokio::fs::try_exists(p).await.unwrap_or(false) => PathBuf::from(p),
        _ => {
            let remote_key = member.remote_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "Backup {} has no local file and no offsite copy",
                    member.id
                )
            })?;
            let transport = Transport::from_settings(settings).ok_or_else(|| {
                anyhow::anyhow!(
                    "Backup {} is offsite-only but no transport is configured",
                    member.id
                )
            })?;
            let download = state.config.restore_tmp_dir.join(&member.filename);
            transport.get(remote_key, &download).await?;
            temps.push(download.clone());
            download
        }
    };

    if !member.encrypted {
        return Ok(StagedArtifact { path: source, temps });
    }

    let envelope = EncryptionEnvelope::new(&settings.encryption_key)?;
    tokio::fs::create_dir_all(&state.config.restore_tmp_dir).await?;
    let plain = state
        .config
        .restore_tmp_dir
        .join(format!("{}.plain", member.filename));
    temps.push(plain.clone());
    let unwrap_in = source.clone();
    let unwrap_out = plain.clone();
    let unwrapped =
        tokio::task::spawn_blocking(move || envelope.unwrap_file(&unwrap_in, &unwrap_out)).await?;
    if let Err(e) = unwrapped {
        StagedArtifact { path: plain, temps }.cleanup().await;
        return Err(e);
    }
    Ok(StagedArtifact { path: plain, temps })
}
