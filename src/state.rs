use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::models::backup::BackupKind;
use crate::services::scheduler::BackupScheduler;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, Serialize)]
pub struct CurrentBackup {
    pub id: String,
    pub kind: BackupKind,
    pub started_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreProgress {
    pub target_timestamp: Option<i64>,
    pub target_backup_id: Option<String>,
    pub total_steps: usize,
    pub current_step: usize,
    pub state: RestoreState,
    /// Set when a mid-chain failure left the target partially restored:
    /// steps before this index already mutated the database and are not
    /// rolled back.
    pub partially_restored_at_step: Option<usize>,
    pub error: Option<String>,
}

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    /// Single-slot gates: one backup and one restore may run at a time;
    /// a second attempt is rejected, never queued.
    pub backup_gate: Arc<Semaphore>,
    pub restore_gate: Arc<Semaphore>,
    pub current_backup: Mutex<Option<CurrentBackup>>,
    pub restore_progress: Mutex<Option<RestoreProgress>>,
    /// Set once at startup; settings updates reschedule through it.
    pub scheduler: OnceLock<Arc<BackupScheduler>>,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        Self {
            db,
            config,
            backup_gate: Arc::new(Semaphore::new(1)),
            restore_gate: Arc::new(Semaphore::new(1)),
            current_backup: Mutex::new(None),
            restore_progress: Mutex::new(None),
            scheduler: OnceLock::new(),
        }
    }
}
