use crate::error::AppError;
use crate::models::backup::{self, BackupKind};
use crate::models::settings::Settings;
use crate::services::backup_runner;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Cron-driven backups: one job for full dumps, one for incremental
/// oplog slices, both reloadable when the settings change.
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    job_ids: Mutex<Vec<Uuid>>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            job_ids: Mutex::new(Vec::new()),
            state,
        })
    }

    /// (Re)install both cron jobs from the current settings, replacing
    /// any previously scheduled ones. A disabled schedule removes the
    /// jobs and installs nothing.
    pub async fn apply_settings(&self, settings: &Settings) -> anyhow::Result<()> {
        let mut job_ids = self.job_ids.lock().await;
        {
            let scheduler = self.scheduler.lock().await;
            for id in job_ids.drain(..) {
                if let Err(e) = scheduler.remove(&id).await {
                    tracing::warn!(job_id = %id, "Failed to remove scheduled job: {}", e);
                }
            }
        }

        if !settings.schedule_enabled {
            tracing::info!("Backup schedule disabled");
            return Ok(());
        }

        let full = self
            .schedule_kind(BackupKind::Full, &settings.full_backup_cron)
            .await?;
        let incremental = self
            .schedule_kind(BackupKind::Incremental, &settings.incremental_backup_cron)
            .await?;
        job_ids.push(full);
        job_ids.push(incremental);
        tracing::info!(
            full_cron = %settings.full_backup_cron,
            incremental_cron = %settings.incremental_backup_cron,
            "Backup schedule installed"
        );
        Ok(())
    }

    async fn schedule_kind(&self, kind: BackupKind, cron_expression: &str) -> anyhow::Result<Uuid> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                tracing::info!(kind = kind.as_str(), "Starting scheduled backup");
                match backup_runner::start_backup(state, kind).await {
                    Ok(record) => {
                        tracing::info!(kind = kind.as_str(), backup_id = %record.id, "Scheduled backup started");
                    }
                    // A long-running backup overlapping the next tick is
                    // normal; the tick is skipped, not queued.
                    Err(AppError::AlreadyInProgress(_)) => {
                        tracing::warn!(kind = kind.as_str(), "Skipping scheduled run: backup already running");
                    }
                    Err(e) => {
                        tracing::error!(kind = kind.as_str(), error = %e, "Scheduled backup failed to start");
                    }
                }
            })
        })?;

        let id = self.scheduler.lock().await.add(job).await?;
        tracing::info!(kind = kind.as_str(), cron = %cron_expression, "Backup job scheduled");
        Ok(id)
    }

    /// Load settings, install the jobs, start ticking. When scheduling is
    /// enabled and no full backup exists yet, one is kicked off right
    /// away so incrementals have a base to chain to.
    pub async fn init(&self) -> anyhow::Result<()> {
        let db = self.state.db.clone();
        let (settings, has_full) = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            let settings = Settings::load(&conn)?;
            let has_full = backup::find_latest_full_completed(&conn)?.is_some();
            Ok::<_, anyhow::Error>((settings, has_full))
        })
        .await??;

        self.apply_settings(&settings).await?;

        if settings.schedule_enabled && !settings.mongo_url.is_empty() && !has_full {
            tracing::info!("No completed full backup found, starting initial full backup");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = backup_runner::start_backup(state, BackupKind::Full).await {
                    tracing::error!(error = %e, "Initial full backup failed to start");
                }
            });
        }
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
