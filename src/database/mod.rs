pub mod schema;
pub mod sessions;

use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Sqlite,
};
use std::{fs, path::Path, str::FromStr, time::Duration};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Ensures the directory holding the database and its logs exists
pub fn ensure_directory_structure(database_path: &str) -> Result<()> {
    // Handle SQLite URL format (remove "sqlite:" prefix and query if present)
    let clean_path = database_path
        .strip_prefix("sqlite:")
        .unwrap_or(database_path);
    let clean_path = clean_path.split('?').next().unwrap_or(clean_path);
    let db_path = Path::new(clean_path);

    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
        info!("Created directory: {}", parent.display());

        let logs_dir = parent.join("logs");
        fs::create_dir_all(&logs_dir)?;
        info!("Created logs directory: {}", logs_dir.display());
    }

    Ok(())
}

pub async fn create_pool(database_url: &str) -> Result<DbPool> {
    info!("Connecting to SQLite database");

    ensure_directory_structure(database_url)?;

    let connect_opts = SqliteConnectOptions::from_str(database_url)?
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(connect_opts).await?;

    schema::run_migrations(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory pool with the schema applied
pub async fn create_memory_pool() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    schema::run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn close_pool(pool: DbPool) {
    info!("Closing database connection pool");
    pool.close().await;
}
