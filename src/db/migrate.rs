use crate::db::connection::DbPool;
use rusqlite::Connection;
use std::fs;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  id TEXT PRIMARY KEY,
  filename TEXT NOT NULL,
  kind TEXT NOT NULL CHECK(kind IN ('full','incremental')),
  status TEXT NOT NULL CHECK(status IN ('in_progress','completed','failed','skipped','upload_failed','deletion_pending')),
  timestamp INTEGER NOT NULL,
  size INTEGER NOT NULL DEFAULT 0,
  local_path TEXT,
  remote_path TEXT,
  encrypted INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  completed_at INTEGER,
  base_backup_id TEXT,
  oplog_start_ts INTEGER,
  oplog_end_ts INTEGER
);

CREATE INDEX IF NOT EXISTS idx_backups_timestamp ON backups(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_backups_kind_status ON backups(kind, status);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  timestamp INTEGER NOT NULL,
  level TEXT NOT NULL,
  message TEXT NOT NULL,
  details TEXT,
  backup_id TEXT,
  kind TEXT,
  status TEXT
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_logs_backup_id ON logs(backup_id);
"#;

/// Apply the schema to a single connection. Split out so tests can run
/// against an in-memory database.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

pub fn migrate(pool: &DbPool, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    fs::create_dir_all(data_dir)?;

    let conn = pool.get()?;
    init_schema(&conn)?;

    // Idempotent migrations for databases created before PITR cursors
    // were tracked explicitly.
    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.contains(&column.to_string()))
    };

    if !has_column("backups", "base_backup_id")? {
        conn.execute_batch("ALTER TABLE backups ADD COLUMN base_backup_id TEXT")?;
    }
    if !has_column("backups", "oplog_start_ts")? {
        conn.execute_batch("ALTER TABLE backups ADD COLUMN oplog_start_ts INTEGER")?;
    }
    if !has_column("backups", "oplog_end_ts")? {
        conn.execute_batch("ALTER TABLE backups ADD COLUMN oplog_end_ts INTEGER")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
