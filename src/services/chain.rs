use crate::error::AppError;
use crate::models::backup::{self, BackupKind, BackupRecord};
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no full backup available at or before the target time")]
    NoBaseBackup,
    #[error(transparent)]
    Metadata(#[from] anyhow::Error),
}

impl From<ChainError> for AppError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::NoBaseBackup => AppError::NoBaseBackup,
            ChainError::Metadata(e) => AppError::Internal(e),
        }
    }
}

/// Ordered backup sequence reconstructing state at `target_timestamp`:
/// one full backup followed by its incrementals, replay order.
#[derive(Debug, Clone, Serialize)]
pub struct RestoreChain {
    pub target_timestamp: i64,
    pub base_full: BackupRecord,
    pub incrementals: Vec<BackupRecord>,
    pub total_estimated_size: i64,
}

impl RestoreChain {
    pub fn members(&self) -> Vec<&BackupRecord> {
        std::iter::once(&self.base_full)
            .chain(self.incrementals.iter())
            .collect()
    }

    pub fn len(&self) -> usize {
        1 + self.incrementals.len()
    }
}

/// Minimal chain for a point in time: the newest completed full backup at
/// or before the target (inclusive), then every completed incremental in
/// `(base.timestamp, target]` ascending. Never selects a backup after the
/// target. This is a point-in-time read of the metadata store; resolution
/// is not locked against concurrent backup creation.
pub fn resolve_chain(conn: &Connection, target_ms: i64) -> Result<RestoreChain, ChainError> {
    let base_full = backup::find_full_at_or_before(conn, target_ms)?
        .ok_or(ChainError::NoBaseBackup)?;
    let incrementals = backup::find_incrementals_between(conn, base_full.timestamp, target_ms)?;
    Ok(build(target_ms, base_full, incrementals))
}

/// Chain needed to restore a specific backup id: a full backup restores
/// alone; an incremental needs its base full plus every intervening
/// incremental up to and including itself.
pub fn resolve_chain_for_backup(
    conn: &Connection,
    target: &BackupRecord,
) -> Result<RestoreChain, ChainError> {
    if target.kind == BackupKind::Full {
        return Ok(build(target.timestamp, target.clone(), Vec::new()));
    }

    // Prefer the base recorded at creation time; fall back to the
    // nearest-earlier-full query for records predating the explicit link.
    let base_full = match &target.base_backup_id {
        Some(base_id) => backup::find_by_id(conn, base_id)?
            .filter(|b| b.status == crate::models::backup::BackupStatus::Completed),
        None => None,
    };
    let base_full = match base_full {
        Some(b) => b,
        None => backup::find_full_at_or_before(conn, target.timestamp)?
            .ok_or(ChainError::NoBaseBackup)?,
    };

    let incrementals =
        backup::find_incrementals_between(conn, base_full.timestamp, target.timestamp)?;
    Ok(build(target.timestamp, base_full, incrementals))
}

fn build(target_ms: i64, base_full: BackupRecord, incrementals: Vec<BackupRecord>) -> RestoreChain {
    let total_estimated_size =
        base_full.size + incrementals.iter().map(|b| b.size).sum::<i64>();
    RestoreChain {
        target_timestamp: target_ms,
        base_full,
        incrementals,
        total_estimated_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::init_schema;
    use crate::models::backup::{create, generate_backup_id, update_fields, NewBackup};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn completed(
        conn: &Connection,
        kind: BackupKind,
        ts: i64,
        size: i64,
        base: Option<&str>,
    ) -> BackupRecord {
        let rec = create(conn, &NewBackup {
            id: generate_backup_id(),
            filename: format!("{}_{}.gz", kind.as_str(), ts),
            kind,
            timestamp: ts,
            local_path: format!("/tmp/{}_{}.gz", kind.as_str(), ts),
            base_backup_id: base.map(String::from),
        })
        .unwrap();
        update_fields(conn, &rec.id, &[
            ("status", &"completed" as &dyn rusqlite::types::ToSql),
            ("size", &size),
        ])
        .unwrap();
        backup::find_by_id(conn, &rec.id).unwrap().unwrap()
    }

    #[test]
    fn test_chain_picks_latest_base_and_window_incrementals() {
        let conn = test_conn();
        completed(&conn, BackupKind::Full, 1000, 500, None);
        completed(&conn, BackupKind::Incremental, 1100, 10, None);
        completed(&conn, BackupKind::Incremental, 1200, 15, None);

        let chain = resolve_chain(&conn, 1150).unwrap();
        assert_eq!(chain.base_full.timestamp, 1000);
        assert_eq!(chain.incrementals.len(), 1);
        assert_eq!(chain.incrementals[0].timestamp, 1100);
        assert_eq!(chain.total_estimated_size, 510);
    }

    #[test]
    fn test_target_equal_to_backup_timestamp_is_included() {
        let conn = test_conn();
        completed(&conn, BackupKind::Full, 1000, 500, None);
        completed(&conn, BackupKind::Incremental, 1100, 10, None);

        let chain = resolve_chain(&conn, 1100).unwrap();
        assert_eq!(chain.incrementals.len(), 1);
        assert_eq!(chain.incrementals[0].timestamp, 1100);
    }

    #[test]
    fn test_never_selects_backups_after_target() {
        let conn = test_conn();
        completed(&conn, BackupKind::Full, 1000, 500, None);
        completed(&conn, BackupKind::Full, 2000, 600, None);
        completed(&conn, BackupKind::Incremental, 2100, 5, None);

        let chain = resolve_chain(&conn, 1999).unwrap();
        assert_eq!(chain.base_full.timestamp, 1000);
        assert!(chain.incrementals.is_empty());
    }

    #[test]
    fn test_no_base_backup_error() {
        let conn = test_conn();
        assert!(matches!(
            resolve_chain(&conn, 5000),
            Err(ChainError::NoBaseBackup)
        ));

        // A full backup after the target does not help.
        completed(&conn, BackupKind::Full, 9000, 500, None);
        assert!(matches!(
            resolve_chain(&conn, 5000),
            Err(ChainError::NoBaseBackup)
        ));
    }

    #[test]
    fn test_incrementals_only_from_newest_applicable_full() {
        let conn = test_conn();
        completed(&conn, BackupKind::Full, 1000, 500, None);
        completed(&conn, BackupKind::Incremental, 1500, 10, None);
        completed(&conn, BackupKind::Full, 2000, 600, None);
        completed(&conn, BackupKind::Incremental, 2500, 20, None);

        let chain = resolve_chain(&conn, 3000).unwrap();
        assert_eq!(chain.base_full.timestamp, 2000);
        let ts: Vec<i64> = chain.incrementals.iter().map(|b| b.timestamp).collect();
        assert_eq!(ts, vec![2500]);
        assert_eq!(chain.total_estimated_size, 620);
    }

    #[test]
    fn test_chain_for_incremental_uses_stored_base_id() {
        let conn = test_conn();
        let full = completed(&conn, BackupKind::Full, 1000, 500, None);
        completed(&conn, BackupKind::Incremental, 1100, 10, Some(&full.id));
        let target = completed(&conn, BackupKind::Incremental, 1200, 15, Some(&full.id));

        let chain = resolve_chain_for_backup(&conn, &target).unwrap();
        assert_eq!(chain.base_full.id, full.id);
        let ts: Vec<i64> = chain.incrementals.iter().map(|b| b.timestamp).collect();
        assert_eq!(ts, vec![1100, 1200]);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_chain_for_full_is_single_member() {
        let conn = test_conn();
        let full = completed(&conn, BackupKind::Full, 1000, 500, None);
        let chain = resolve_chain_for_backup(&conn, &full).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.total_estimated_size, 500);
    }

    #[test]
    fn test_chain_for_orphan_incremental_fails() {
        let conn = test_conn();
        let target = completed(&conn, BackupKind::Incremental, 1200, 15, None);
        assert!(matches!(
            resolve_chain_for_backup(&conn, &target),
            Err(ChainError::NoBaseBackup)
        ));
    }
}
