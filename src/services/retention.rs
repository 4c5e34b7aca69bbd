use crate::models::backup::{self, BackupKind, BackupRecord, BackupStatus};
use crate::models::settings::Settings;
use crate::services::event_log::{self, LogContext};
use crate::services::transport::Transport;
use crate::state::AppState;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub keep_last_n: i64,
    pub retention_days: i64,
}

impl RetentionPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            keep_last_n: settings.keep_last_n_backups.max(1),
            retention_days: settings.retention_days.max(1),
        }
    }
}

/// Decide which completed backups may be deleted under count/age limits
/// without breaking restorability. Pure over the record set; the sweep
/// executes the result best-effort.
///
/// Guarantees:
/// - the newest completed full backup always survives;
/// - a full backup with surviving dependent incrementals always survives;
/// - incrementals whose base full no longer exists (or leaves in the same
///   pass) are removed as orphans.
pub fn plan(completed: &[BackupRecord], policy: &RetentionPolicy, now_ms: i64) -> Vec<String> {
    let cutoff = now_ms - policy.retention_days * 24 * 60 * 60 * 1000;

    let mut fulls: Vec<&BackupRecord> = completed
        .iter()
        .filter(|b| b.kind == BackupKind::Full)
        .collect();
    fulls.sort_by_key(|b| std::cmp::Reverse(b.timestamp));

    let mut incrementals: Vec<&BackupRecord> = completed
        .iter()
        .filter(|b| b.kind == BackupKind::Incremental)
        .collect();
    incrementals.sort_by_key(|b| std::cmp::Reverse(b.timestamp));

    // A tenth of the count limit (at least one slot) is reserved for
    // full backups, the rest goes to incrementals.
    let full_slots = ((policy.keep_last_n + 9) / 10).max(1);
    let incremental_slots = (policy.keep_last_n - full_slots).max(0);

    // Derived base: stored link when the referenced full still exists,
    // nearest earlier full otherwise.
    let base_of = |inc: &BackupRecord| -> Option<String> {
        if let Some(base_id) = &inc.base_backup_id {
            if fulls.iter().any(|f| &f.id == base_id) {
                return Some(base_id.clone());
            }
        }
        fulls
            .iter()
            .find(|f| f.timestamp < inc.timestamp)
            .map(|f| f.id.clone())
    };

    let mut doomed: HashSet<String> = HashSet::new();
    let mut order: Vec<String> = Vec::new();
    let condemn = |id: &str, doomed: &mut HashSet<String>, order: &mut Vec<String>| {
        if doomed.insert(id.to_string()) {
            order.push(id.to_string());
        }
    };

    // Incrementals first: count/age eligibility, no protection.
    for (index, inc) in incrementals.iter().enumerate() {
        let by_count = index as i64 >= incremental_slots;
        let by_age = inc.timestamp < cutoff;
        if by_count || by_age {
            condemn(&inc.id, &mut doomed, &mut order);
        }
    }

    // Fulls: the newest one is untouchable, the rest are eligible by
    // count/age but protected while any surviving incremental depends on
    // them.
    let surviving_bases: HashSet<String> = incrementals
        .iter()
        .filter(|inc| !doomed.contains(&inc.id))
        .filter_map(|inc| base_of(inc))
        .collect();

    for (index, full) in fulls.iter().enumerate() {
        if index == 0 {
            continue;
        }
        let by_count = index as i64 >= full_slots;
        let by_age = full.timestamp < cutoff;
        if (by_count || by_age) && !surviving_bases.contains(&full.id) {
            condemn(&full.id, &mut doomed, &mut order);
        }
    }

    // Orphan cleanup: an incremental whose base is absent or leaves in
    // this pass must not survive it.
    for inc in &incrementals {
        if doomed.contains(&inc.id) {
            continue;
        }
        match base_of(inc) {
            Some(base_id) if !doomed.contains(&base_id) => {}
            _ => condemn(&inc.id, &mut doomed, &mut order),
        }
    }

    order
}

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub pending: usize,
    pub failed: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Storage object removal failed; the row is kept as
    /// `deletion_pending` and retried on the next sweep rather than
    /// silently dropped while storage leaks.
    Pending,
}

/// Prune old backups per settings. Deletions are independent: one
/// failure is logged and the sweep continues with the next record.
pub async fn apply_retention(state: &Arc<AppState>) -> anyhow::Result<SweepReport> {
    let db = state.db.clone();
    let (settings, completed, pending) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let settings = Settings::load(&conn)?;
        let completed = backup::find_completed(&conn)?;
        let pending = backup::find_deletion_pending(&conn)?;
        Ok::<_, anyhow::Error>((settings, completed, pending))
    })
    .await??;

    let policy = RetentionPolicy::from_settings(&settings);
    let now_ms = chrono::Utc::now().timestamp_millis();
    let plan_ids = plan(&completed, &policy, now_ms);

    let mut report = SweepReport::default();

    // Earlier sweeps may have left rows awaiting a storage retry.
    for rec in pending {
        match delete_backup(state, &rec.id).await {
            Ok(DeleteOutcome::Deleted) => report.deleted += 1,
            Ok(DeleteOutcome::Pending) => report.pending += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(backup_id = %rec.id, "Retry of pending deletion failed: {}", e);
            }
        }
    }

    for id in &plan_ids {
        match delete_backup(state, id).await {
            Ok(DeleteOutcome::Deleted) => report.deleted += 1,
            Ok(DeleteOutcome::Pending) => report.pending += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(backup_id = %id, "Retention deletion failed: {}", e);
            }
        }
    }

    if report.deleted > 0 || report.pending > 0 {
        event_log::info(
            &state.db,
            &format!(
                "Retention policy applied: {} deleted, {} pending retry",
                report.deleted, report.pending
            ),
            LogContext::default(),
        );
    }
    Ok(report)
}

/// Remove a backup's storage objects, then its metadata row. If any
/// storage delete fails the row flips to `deletion_pending` instead of
/// being removed, keeping the leaked object tracked.
pub async fn delete_backup(state: &Arc<AppState>, id: &str) -> anyhow::Result<DeleteOutcome> {
    let db = state.db.clone();
    let bid = id.to_string();
    let (record, settings) = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        let record = backup::find_by_id(&conn, &bid)?
            .ok_or_else(|| anyhow::anyhow!("Backup not found: {}", bid))?;
        let settings = Settings::load(&conn)?;
        Ok::<_, anyhow::Error>((record, settings))
    })
    .await??;

    let mut storage_failure: Option<String> = None;

    if let Some(local_path) = &record.local_path {
        match tokio::fs::remove_file(local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => storage_failure = Some(format!("local delete failed: {}", e)),
        }
    }

    if let Some(remote_path) = &record.remote_path {
        match Transport::from_settings(&settings) {
            Some(transport) => {
                if let Err(e) = transport.delete(remote_path).await {
                    storage_failure = Some(format!("remote delete failed: {}", e));
                }
            }
            // Offsite store no longer configured; the object is out of
            // reach and retrying forever would wedge the row.
            None => {
                tracing::warn!(backup_id = %record.id, remote_path = %remote_path,
                    "No transport configured, leaving remote object behind");
            }
        }
    }

    if let Some(reason) = storage_failure {
        let db = state.db.clone();
        let bid = record.id.clone();
        let reason2 = reason.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            backup::update_fields(&conn, &bid, &[
                ("status", &BackupStatus::DeletionPending.as_str() as &dyn rusqlite::types::ToSql),
                ("error", &reason2),
            ])
        })
        .await??;
        event_log::warning(
            &state.db,
            &format!("Backup {} deletion pending: {}", record.id, reason),
            LogContext::backup(&record.id),
        );
        return Ok(DeleteOutcome::Pending);
    }

    let db = state.db.clone();
    let bid = record.id.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::delete(&conn, &bid)
    })
    .await??;

    event_log::info(
        &state.db,
        &format!("Backup deleted: {}", record.id),
        LogContext::backup(&record.id),
    );
    Ok(DeleteOutcome::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        id: &str,
        kind: BackupKind,
        ts: i64,
        base: Option<&str>,
    ) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            filename: format!("{}.gz", id),
            kind,
            status: BackupStatus::Completed,
            timestamp: ts,
            size: 100,
            local_path: None,
            remote_path: None,
            encrypted: false,
            error: None,
            completed_at: Some(ts),
            base_backup_id: base.map(String::from),
            oplog_start_ts: None,
            oplog_end_ts: None,
        }
    }

    const DAY: i64 = 24 * 60 * 60 * 1000;

    #[test]
    fn test_newest_full_always_survives() {
        // One ancient full, aggressive limits: it must still survive.
        let records = vec![record("f1", BackupKind::Full, 1000, None)];
        let policy = RetentionPolicy { keep_last_n: 1, retention_days: 1 };
        let doomed = plan(&records, &policy, 1000 + 365 * DAY);
        assert!(doomed.is_empty());
    }

    #[test]
    fn test_full_with_dependents_protected_despite_count_pressure() {
        let now = 100 * DAY;
        let records = vec![
            record("f1", BackupKind::Full, now - DAY, None),
            record("i1", BackupKind::Incremental, now - DAY + 100, Some("f1")),
            record("i2", BackupKind::Incremental, now - DAY + 200, Some("f1")),
            record("i3", BackupKind::Incremental, now - DAY + 300, Some("f1")),
        ];
        let policy = RetentionPolicy { keep_last_n: 1, retention_days: 30 };
        let doomed = plan(&records, &policy, now);
        // keep_last_n=1 reserves the single slot for the full; all
        // incrementals fall to count pressure but the full survives.
        assert!(!doomed.contains(&"f1".to_string()));
    }

    #[test]
    fn test_old_full_without_dependents_deleted() {
        let now = 100 * DAY;
        let records = vec![
            record("f_old", BackupKind::Full, now - 60 * DAY, None),
            record("f_new", BackupKind::Full, now - DAY, None),
        ];
        let policy = RetentionPolicy { keep_last_n: 30, retention_days: 30 };
        let doomed = plan(&records, &policy, now);
        assert_eq!(doomed, vec!["f_old".to_string()]);
    }

    #[test]
    fn test_old_full_with_surviving_dependent_kept() {
        let now = 100 * DAY;
        let records = vec![
            record("f_old", BackupKind::Full, now - 60 * DAY, None),
            // Recent incremental chained to the old full (no newer full
            // between them).
            record("i1", BackupKind::Incremental, now - DAY, Some("f_old")),
        ];
        let policy = RetentionPolicy { keep_last_n: 30, retention_days: 30 };
        let doomed = plan(&records, &policy, now);
        assert!(!doomed.contains(&"f_old".to_string()));
        assert!(!doomed.contains(&"i1".to_string()));
    }

    #[test]
    fn test_full_freed_when_last_dependent_leaves_same_pass() {
        let now = 100 * DAY;
        let records = vec![
            record("f_old", BackupKind::Full, now - 60 * DAY, None),
            record("i_old", BackupKind::Incremental, now - 59 * DAY, Some("f_old")),
            record("f_new", BackupKind::Full, now - DAY, None),
        ];
        let policy = RetentionPolicy { keep_last_n: 30, retention_days: 30 };
        let doomed = plan(&records, &policy, now);
        assert!(doomed.contains(&"i_old".to_string()));
        assert!(doomed.contains(&"f_old".to_string()));
        assert!(!doomed.contains(&"f_new".to_string()));
    }

    #[test]
    fn test_orphan_incremental_removed() {
        let now = 100 * DAY;
        // Base full was deleted manually; the incremental has no earlier
        // full at all.
        let records = vec![
            record("f_new", BackupKind::Full, now - DAY, None),
            record("i_orphan", BackupKind::Incremental, now - 2 * DAY, Some("f_gone")),
        ];
        let policy = RetentionPolicy { keep_last_n: 30, retention_days: 30 };
        let doomed = plan(&records, &policy, now);
        assert_eq!(doomed, vec!["i_orphan".to_string()]);
    }

    #[test]
    fn test_no_orphans_after_plan() {
        // Invariant check across a messy record set: for every surviving
        // incremental there is a surviving earlier full.
        let now = 100 * DAY;
        let mut records = Vec::new();
        for (i, days_ago) in [80i64, 50, 20, 2].iter().enumerate() {
            records.push(record(
                &format!("f{}", i),
                BackupKind::Full,
                now - days_ago * DAY,
                None,
            ));
        }
        for (i, days_ago) in [79i64, 45, 15, 1].iter().enumerate() {
            records.push(record(
                &format!("i{}", i),
                BackupKind::Incremental,
                now - days_ago * DAY,
                None,
            ));
        }
        let policy = RetentionPolicy { keep_last_n: 5, retention_days: 30 };
        let doomed: HashSet<String> = plan(&records, &policy, now).into_iter().collect();

        let surviving: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| !doomed.contains(&r.id))
            .collect();
        assert!(surviving
            .iter()
            .any(|r| r.kind == BackupKind::Full));
        for inc in surviving.iter().filter(|r| r.kind == BackupKind::Incremental) {
            assert!(
                surviving
                    .iter()
                    .any(|f| f.kind == BackupKind::Full && f.timestamp < inc.timestamp),
                "incremental {} left orphaned",
                inc.id
            );
        }
    }

    #[test]
    fn test_incremental_count_pressure() {
        let now = 100 * DAY;
        let mut records = vec![record("f1", BackupKind::Full, now - 10 * DAY, None)];
        for i in 0..10 {
            records.push(record(
                &format!("i{}", i),
                BackupKind::Incremental,
                now - 9 * DAY + i * 1000,
                Some("f1"),
            ));
        }
        // full_slots = 1, incremental_slots = 4: the 6 oldest incrementals go.
        let policy = RetentionPolicy { keep_last_n: 5, retention_days: 30 };
        let doomed = plan(&records, &policy, now);
        assert_eq!(doomed.len(), 6);
        for id in ["i0", "i1", "i2", "i3", "i4", "i5"] {
            assert!(doomed.contains(&id.to_string()), "{} should be doomed", id);
        }
        assert!(!doomed.contains(&"f1".to_string()));
    }
}
