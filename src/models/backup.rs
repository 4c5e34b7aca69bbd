use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(BackupKind::Full),
            "incremental" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
    Skipped,
    UploadFailed,
    DeletionPending,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
            BackupStatus::Skipped => "skipped",
            BackupStatus::UploadFailed => "upload_failed",
            BackupStatus::DeletionPending => "deletion_pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(BackupStatus::InProgress),
            "completed" => Some(BackupStatus::Completed),
            "failed" => Some(BackupStatus::Failed),
            "skipped" => Some(BackupStatus::Skipped),
            "upload_failed" => Some(BackupStatus::UploadFailed),
            "deletion_pending" => Some(BackupStatus::DeletionPending),
            _ => None,
        }
    }
}

/// One row per backup attempt. `timestamp` (ms since epoch) is the
/// ordering key for chain resolution; `oplog_start_ts`/`oplog_end_ts`
/// are packed BSON timestamps recording the exact replication-log
/// positions covered by the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub filename: String,
    pub kind: BackupKind,
    pub status: BackupStatus,
    pub timestamp: i64,
    pub size: i64,
    pub local_path: Option<String>,
    pub remote_path: Option<String>,
    pub encrypted: bool,
    pub error: Option<String>,
    pub completed_at: Option<i64>,
    pub base_backup_id: Option<String>,
    pub oplog_start_ts: Option<i64>,
    pub oplog_end_ts: Option<i64>,
}

fn row_to_backup(row: &Row) -> rusqlite::Result<BackupRecord> {
    let kind: String = row.get("kind")?;
    let status: String = row.get("status")?;
    Ok(BackupRecord {
        id: row.get("id")?,
        filename: row.get("filename")?,
        kind: BackupKind::parse(&kind).unwrap_or(BackupKind::Full),
        status: BackupStatus::parse(&status).unwrap_or(BackupStatus::Failed),
        timestamp: row.get("timestamp")?,
        size: row.get("size")?,
        local_path: row.get("local_path")?,
        remote_path: row.get("remote_path")?,
        encrypted: row.get::<_, i64>("encrypted")? != 0,
        error: row.get("error")?,
        completed_at: row.get("completed_at")?,
        base_backup_id: row.get("base_backup_id")?,
        oplog_start_ts: row.get("oplog_start_ts")?,
        oplog_end_ts: row.get("oplog_end_ts")?,
    })
}

pub fn generate_backup_id() -> String {
    format!("bak_{}", Uuid::new_v4().simple())
}

pub struct NewBackup {
    pub id: String,
    pub filename: String,
    pub kind: BackupKind,
    pub timestamp: i64,
    pub local_path: String,
    pub base_backup_id: Option<String>,
}

pub fn create(conn: &Connection, data: &NewBackup) -> anyhow::Result<BackupRecord> {
    conn.execute(
        "INSERT INTO backups (id, filename, kind, status, timestamp, size, local_path, base_backup_id)
         VALUES (?1, ?2, ?3, 'in_progress', ?4, 0, ?5, ?6)",
        params![
            data.id,
            data.filename,
            data.kind.as_str(),
            data.timestamp,
            data.local_path,
            data.base_backup_id
        ],
    )?;
    find_by_id(conn, &data.id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created backup"))
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backups ORDER BY timestamp DESC")?;
    let rows = stmt.query_map([], |row| row_to_backup(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backups WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_backup(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_completed(conn: &Connection) -> anyhow::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE status = 'completed' ORDER BY timestamp DESC",
    )?;
    let rows = stmt.query_map([], |row| row_to_backup(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_last_completed(conn: &Connection) -> anyhow::Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE status = 'completed' ORDER BY timestamp DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([], |row| row_to_backup(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn find_latest_full_completed(conn: &Connection) -> anyhow::Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE kind = 'full' AND status = 'completed'
         ORDER BY timestamp DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map([], |row| row_to_backup(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

/// Most recent completed full backup with timestamp <= the target
/// (inclusive bound: a backup taken exactly at the target is usable).
pub fn find_full_at_or_before(
    conn: &Connection,
    target_ms: i64,
) -> anyhow::Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE kind = 'full' AND status = 'completed' AND timestamp <= ?
         ORDER BY timestamp DESC LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![target_ms], |row| row_to_backup(row))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

/// Completed incrementals in the half-open window (after_ms, until_ms],
/// ascending by timestamp (replay order).
pub fn find_incrementals_between(
    conn: &Connection,
    after_ms: i64,
    until_ms: i64,
) -> anyhow::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE kind = 'incremental' AND status = 'completed'
         AND timestamp > ? AND timestamp <= ? ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map(params![after_ms, until_ms], |row| row_to_backup(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_deletion_pending(conn: &Connection) -> anyhow::Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups WHERE status = 'deletion_pending' ORDER BY timestamp ASC",
    )?;
    let rows = stmt.query_map([], |row| row_to_backup(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn update_fields(
    conn: &Connection,
    id: &str,
    fields: &[(&str, &dyn rusqlite::types::ToSql)],
) -> anyhow::Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let sets: Vec<String> = fields.iter().map(|(k, _)| format!("{} = ?", k)).collect();
    let sql = format!("UPDATE backups SET {} WHERE id = ?", sets.join(", "));
    let mut params: Vec<&dyn rusqlite::types::ToSql> = fields.iter().map(|(_, v)| *v).collect();
    params.push(&id);
    conn.execute(&sql, params.as_slice())?;
    Ok(())
}

pub fn mark_status(conn: &Connection, id: &str, status: BackupStatus) -> anyhow::Result<()> {
    update_fields(conn, id, &[
        ("status", &status.as_str() as &dyn rusqlite::types::ToSql),
    ])
}

pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    update_fields(conn, id, &[
        ("status", &"failed" as &dyn rusqlite::types::ToSql),
        ("error", &error),
        ("completed_at", &now),
    ])
}

pub fn mark_skipped(conn: &Connection, id: &str, reason: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    update_fields(conn, id, &[
        ("status", &"skipped" as &dyn rusqlite::types::ToSql),
        ("error", &reason),
        ("completed_at", &now),
        ("local_path", &None::<String>),
    ])
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM backups WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::init_schema;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn insert(conn: &Connection, kind: BackupKind, ts: i64) -> BackupRecord {
        let rec = create(conn, &NewBackup {
            id: generate_backup_id(),
            filename: format!("{}_{}.gz", kind.as_str(), ts),
            kind,
            timestamp: ts,
            local_path: format!("/tmp/{}_{}.gz", kind.as_str(), ts),
            base_backup_id: None,
        })
        .unwrap();
        update_fields(conn, &rec.id, &[
            ("status", &"completed" as &dyn rusqlite::types::ToSql),
            ("size", &100i64),
        ])
        .unwrap();
        find_by_id(conn, &rec.id).unwrap().unwrap()
    }

    #[test]
    fn test_create_starts_in_progress() {
        let conn = test_conn();
        let rec = create(&conn, &NewBackup {
            id: generate_backup_id(),
            filename: "full_1.gz".into(),
            kind: BackupKind::Full,
            timestamp: 1000,
            local_path: "/tmp/full_1.gz".into(),
            base_backup_id: None,
        })
        .unwrap();
        assert_eq!(rec.status, BackupStatus::InProgress);
        assert_eq!(rec.size, 0);
    }

    #[test]
    fn test_find_full_at_or_before_is_inclusive() {
        let conn = test_conn();
        insert(&conn, BackupKind::Full, 1000);
        insert(&conn, BackupKind::Full, 2000);

        let found = find_full_at_or_before(&conn, 2000).unwrap().unwrap();
        assert_eq!(found.timestamp, 2000);

        let found = find_full_at_or_before(&conn, 1999).unwrap().unwrap();
        assert_eq!(found.timestamp, 1000);

        assert!(find_full_at_or_before(&conn, 999).unwrap().is_none());
    }

    #[test]
    fn test_incrementals_window_is_half_open_and_ascending() {
        let conn = test_conn();
        insert(&conn, BackupKind::Incremental, 1100);
        insert(&conn, BackupKind::Incremental, 1300);
        insert(&conn, BackupKind::Incremental, 1200);

        let incs = find_incrementals_between(&conn, 1100, 1300).unwrap();
        let ts: Vec<i64> = incs.iter().map(|b| b.timestamp).collect();
        assert_eq!(ts, vec![1200, 1300]);
    }

    #[test]
    fn test_failed_records_excluded_from_completed_queries() {
        let conn = test_conn();
        let rec = create(&conn, &NewBackup {
            id: generate_backup_id(),
            filename: "full_1.gz".into(),
            kind: BackupKind::Full,
            timestamp: 1000,
            local_path: "/tmp/full_1.gz".into(),
            base_backup_id: None,
        })
        .unwrap();
        mark_failed(&conn, &rec.id, "mongodump exited with code 1").unwrap();

        assert!(find_latest_full_completed(&conn).unwrap().is_none());
        let rec = find_by_id(&conn, &rec.id).unwrap().unwrap();
        assert_eq!(rec.status, BackupStatus::Failed);
        assert!(rec.error.is_some());
    }
}
