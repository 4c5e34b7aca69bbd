use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn create_pool(db_path: &str) -> DbPool {
    let manager = SqliteConnectionManager::file(db_path);
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .expect("Failed to create DB pool");

    // Durability over throughput: this database is the only record of
    // which backups exist and where their artifacts live.
    let conn = pool.get().expect("Failed to get DB connection");
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )
    .expect("Failed to set PRAGMA");

    pool
}

pub fn close_pool(pool: &DbPool) {
    // Connections close when the pool drops; a checkpoint here is a
    // no-op in DELETE mode but harmless.
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }
}
