use crate::db::connection::DbPool;
use crate::models::log_entry::{self, NewLogEntry};

/// Optional context attached to a structured event.
#[derive(Debug, Default, Clone)]
pub struct LogContext {
    pub backup_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl LogContext {
    pub fn backup(backup_id: &str) -> Self {
        Self {
            backup_id: Some(backup_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Fire-and-forget append to the event log. The row lands in the `logs`
/// table on a blocking worker; a write failure is downgraded to a trace
/// warning and never propagates to the caller.
pub fn emit(db: &DbPool, level: &str, message: &str, ctx: LogContext) {
    match level {
        "error" => tracing::error!(backup_id = ?ctx.backup_id, "{}", message),
        "warning" => tracing::warn!(backup_id = ?ctx.backup_id, "{}", message),
        _ => tracing::info!(backup_id = ?ctx.backup_id, "{}", message),
    }

    let db = db.clone();
    let entry = NewLogEntry {
        level: level.to_string(),
        message: message.to_string(),
        details: ctx.details,
        backup_id: ctx.backup_id,
        kind: ctx.kind,
        status: ctx.status,
    };
    tokio::task::spawn_blocking(move || {
        let result = db
            .get()
            .map_err(anyhow::Error::from)
            .and_then(|conn| log_entry::insert(&conn, &entry));
        if let Err(e) = result {
            tracing::warn!("Failed to write event log entry: {}", e);
        }
    });
}

pub fn info(db: &DbPool, message: &str, ctx: LogContext) {
    emit(db, "info", message, ctx);
}

pub fn success(db: &DbPool, message: &str, ctx: LogContext) {
    emit(db, "success", message, ctx);
}

pub fn warning(db: &DbPool, message: &str, ctx: LogContext) {
    emit(db, "warning", message, ctx);
}

pub fn error(db: &DbPool, message: &str, ctx: LogContext) {
    emit(db, "error", message, ctx);
}
