use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations");

    create_sessions_table(pool).await?;

    info!("Database migrations completed successfully");
    Ok(())
}

async fn create_sessions_table(pool: &SqlitePool) -> Result<()> {
    debug!("Creating sessions table");
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            instructions TEXT,
            target_area TEXT,
            branch_name TEXT,
            conversation_id TEXT UNIQUE,
            working_directory TEXT,
            archive_name TEXT,
            unpacked_path TEXT,
            state TEXT NOT NULL DEFAULT 'created',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            merged_at TEXT,
            files_created INTEGER NOT NULL DEFAULT 0,
            files_modified INTEGER NOT NULL DEFAULT 0,
            files_deleted INTEGER NOT NULL DEFAULT 0,
            merged BOOLEAN NOT NULL DEFAULT 0,
            validated BOOLEAN NOT NULL DEFAULT 0,
            build_passed BOOLEAN NOT NULL DEFAULT 0,
            tests_passed BOOLEAN NOT NULL DEFAULT 0,
            error_message TEXT
        )
    "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}
