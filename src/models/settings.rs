use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_all(conn: &Connection) -> anyhow::Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut map = HashMap::new();
    for r in rows {
        let (k, v) = r?;
        map.insert(k, v);
    }
    Ok(map)
}

/// Typed view over the key/value settings table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mongo_url: String,
    pub keep_local_backups: bool,
    pub keep_last_n_backups: i64,
    pub retention_days: i64,
    pub full_backup_cron: String,
    pub incremental_backup_cron: String,
    pub schedule_enabled: bool,
    pub enable_encryption: bool,
    #[serde(skip_serializing)]
    pub encryption_key: String,
    pub remote_enabled: bool,
    pub remote_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mongo_url: std::env::var("MONGO_URL").unwrap_or_default(),
            keep_local_backups: true,
            keep_last_n_backups: 30,
            retention_days: 30,
            full_backup_cron: "0 0 2 * * *".into(),
            incremental_backup_cron: "0 */15 * * * *".into(),
            schedule_enabled: false,
            enable_encryption: false,
            encryption_key: std::env::var("BACKUP_ENCRYPTION_KEY").unwrap_or_default(),
            remote_enabled: false,
            remote_dir: String::new(),
        }
    }
}

impl Settings {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        let raw = get_all(conn)?;
        let mut s = Settings::default();

        let str_of = |k: &str| raw.get(k).cloned();
        let bool_of = |k: &str| raw.get(k).map(|v| v == "true" || v == "1");
        let int_of = |k: &str| raw.get(k).and_then(|v| v.parse::<i64>().ok());

        if let Some(v) = str_of("mongo_url") {
            s.mongo_url = v;
        }
        if let Some(v) = bool_of("keep_local_backups") {
            s.keep_local_backups = v;
        }
        if let Some(v) = int_of("keep_last_n_backups") {
            s.keep_last_n_backups = v;
        }
        if let Some(v) = int_of("retention_days") {
            s.retention_days = v;
        }
        if let Some(v) = str_of("full_backup_cron") {
            s.full_backup_cron = v;
        }
        if let Some(v) = str_of("incremental_backup_cron") {
            s.incremental_backup_cron = v;
        }
        if let Some(v) = bool_of("schedule_enabled") {
            s.schedule_enabled = v;
        }
        if let Some(v) = bool_of("enable_encryption") {
            s.enable_encryption = v;
        }
        if let Some(v) = str_of("encryption_key") {
            if !v.is_empty() {
                s.encryption_key = v;
            }
        }
        if let Some(v) = bool_of("remote_enabled") {
            s.remote_enabled = v;
        }
        if let Some(v) = str_of("remote_dir") {
            s.remote_dir = v;
        }
        Ok(s)
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        set(conn, "mongo_url", &self.mongo_url)?;
        set(conn, "keep_local_backups", bool_str(self.keep_local_backups))?;
        set(conn, "keep_last_n_backups", &self.keep_last_n_backups.to_string())?;
        set(conn, "retention_days", &self.retention_days.to_string())?;
        set(conn, "full_backup_cron", &self.full_backup_cron)?;
        set(conn, "incremental_backup_cron", &self.incremental_backup_cron)?;
        set(conn, "schedule_enabled", bool_str(self.schedule_enabled))?;
        set(conn, "enable_encryption", bool_str(self.enable_encryption))?;
        set(conn, "encryption_key", &self.encryption_key)?;
        set(conn, "remote_enabled", bool_str(self.remote_enabled))?;
        set(conn, "remote_dir", &self.remote_dir)?;
        Ok(())
    }

    /// Fatal configuration check for any operation touching MongoDB.
    pub fn require_mongo_url(&self) -> anyhow::Result<&str> {
        if self.mongo_url.is_empty() {
            anyhow::bail!("MongoDB URL not configured");
        }
        Ok(&self.mongo_url)
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrate::init_schema;

    #[test]
    fn test_save_load_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let mut s = Settings::default();
        s.mongo_url = "mongodb://localhost:27017".into();
        s.keep_last_n_backups = 12;
        s.schedule_enabled = true;
        s.save(&conn).unwrap();

        let loaded = Settings::load(&conn).unwrap();
        assert_eq!(loaded.mongo_url, "mongodb://localhost:27017");
        assert_eq!(loaded.keep_last_n_backups, 12);
        assert!(loaded.schedule_enabled);
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let loaded = Settings::load(&conn).unwrap();
        assert_eq!(loaded.retention_days, 30);
        assert!(!loaded.schedule_enabled);
    }
}
