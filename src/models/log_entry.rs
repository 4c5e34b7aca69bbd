use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub backup_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<LogEntry> {
    let details: Option<String> = row.get("details")?;
    Ok(LogEntry {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        level: row.get("level")?,
        message: row.get("message")?,
        details: details.and_then(|d| serde_json::from_str(&d).ok()),
        backup_id: row.get("backup_id")?,
        kind: row.get("kind")?,
        status: row.get("status")?,
    })
}

pub struct NewLogEntry {
    pub level: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub backup_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
}

pub fn insert(conn: &Connection, entry: &NewLogEntry) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    let details = entry
        .details
        .as_ref()
        .map(|d| serde_json::to_string(d))
        .transpose()?;
    conn.execute(
        "INSERT INTO logs (timestamp, level, message, details, backup_id, kind, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            now,
            entry.level,
            entry.message,
            details,
            entry.backup_id,
            entry.kind,
            entry.status
        ],
    )?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub level: Option<String>,
    pub backup_id: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
}

pub fn query(conn: &Connection, q: &LogQuery) -> anyhow::Result<LogPage> {
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(50).clamp(1, 500);

    let mut clauses = String::from("WHERE 1=1");
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(level) = &q.level {
        clauses.push_str(" AND level = ?");
        params.push(Box::new(level.clone()));
    }
    if let Some(backup_id) = &q.backup_id {
        clauses.push_str(" AND backup_id = ?");
        params.push(Box::new(backup_id.clone()));
    }
    if let Some(from) = q.from {
        clauses.push_str(" AND timestamp >= ?");
        params.push(Box::new(from));
    }
    if let Some(to) = q.to {
        clauses.push_str(" AND timestamp <= ?");
        params.push(Box::new(to));
    }

    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        params.iter().map(|p| p.as_ref()).collect();

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM logs {}", clauses),
        param_refs.as_slice(),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT * FROM logs {} ORDER BY timestamp DESC LIMIT {} OFFSET {}",
        clauses,
        limit,
        (page - 1) * limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(param_refs.as_slice(), |row| row_to_entry(row))?;
    let logs: Vec<LogEntry> = rows.filter_map(|r| r.ok()).collect();

    Ok(LogPage {
        logs,
        total,
        page,
        pages: (total + limit - 1) / limit,
    })
}

pub fn delete_all(conn: &Connection) -> anyhow::Result<i64> {
    let changes = conn.execute("DELETE FROM logs", [])?;
    Ok(changes as i64)
}

pub fn delete_older_than(conn: &Connection, cutoff_ms: i64) -> anyhow::Result<i64> {
    let changes = conn.execute("DELETE FROM logs WHERE timestamp < ?", params![cutoff_ms])?;
    Ok(changes as i64)
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

    #[test]
    fn test_query_filters_by_level_and_backup_id() {
        let conn = test_conn();
        for (level, backup_id) in [
            ("info", Some("bak_1")),
            ("error", Some("bak_1")),
            ("info", Some("bak_2")),
            ("info", None),
        ] {
            insert(&conn, &NewLogEntry {
                level: level.into(),
                message: "msg".into(),
                details: None,
                backup_id: backup_id.map(String::from),
                kind: None,
                status: None,
            })
            .unwrap();
        }

        let page = query(&conn, &LogQuery {
            level: Some("info".into()),
            backup_id: Some("bak_1".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].backup_id.as_deref(), Some("bak_1"));
    }

    #[test]
    fn test_pagination_counts() {
        let conn = test_conn();
        for i in 0..7 {
            insert(&conn, &NewLogEntry {
                level: "info".into(),
                message: format!("msg {}", i),
                details: None,
                backup_id: None,
                kind: None,
                status: None,
            })
            .unwrap();
        }
        let page = query(&conn, &LogQuery {
            limit: Some(3),
            page: Some(2),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(page.total, 7);
        assert_eq!(page.pages, 3);
        assert_eq!(page.logs.len(), 3);
    }
}
