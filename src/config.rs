use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub backups_dir: PathBuf,
    pub restore_tmp_dir: PathBuf,
    pub log_level: String,
    /// Upper bound for a single mongodump/mongorestore invocation.
    pub tool_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()),
        );

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            db_path: data_dir.join("backups.db"),
            backups_dir: PathBuf::from(
                std::env::var("BACKUPS_DIR")
                    .unwrap_or_else(|_| data_dir.join("backups").to_string_lossy().into()),
            ),
            restore_tmp_dir: data_dir.join("restore_temp"),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            tool_timeout_secs: std::env::var("TOOL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
        }
    }
}
