use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, FromRow, Row};

use super::DbPool;
use crate::{
    error::{AppError, Result},
    sessions::{Session, SessionState},
};

/// Persistent home of every session record
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn get_by_conversation_id(&self, conversation_id: &str) -> Result<Option<Session>>;
    /// Most recent first
    async fn list(&self, limit: i64) -> Result<Vec<Session>>;
    async fn update(&self, session: &Session) -> Result<()>;

    async fn require(&self, id: &str) -> Result<Session> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", id)))
    }
}

impl<'r> FromRow<'r, SqliteRow> for Session {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<SessionState>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(Session {
            id: row.try_get("id")?,
            description: row.try_get("description")?,
            instructions: row.try_get("instructions")?,
            target_area: row.try_get("target_area")?,
            branch_name: row.try_get("branch_name")?,
            conversation_id: row.try_get("conversation_id")?,
            working_directory: row.try_get("working_directory")?,
            archive_name: row.try_get("archive_name")?,
            unpacked_path: row.try_get("unpacked_path")?,
            state,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            merged_at: row.try_get("merged_at")?,
            files_created: row.try_get("files_created")?,
            files_modified: row.try_get("files_modified")?,
            files_deleted: row.try_get("files_deleted")?,
            merged: row.try_get("merged")?,
            validated: row.try_get("validated")?,
            build_passed: row.try_get("build_passed")?,
            tests_passed: row.try_get("tests_passed")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, description, instructions, target_area, branch_name, conversation_id,
           working_directory, archive_name, unpacked_path, state,
           created_at, updated_at, started_at, completed_at, merged_at,
           files_created, files_modified, files_deleted,
           merged, validated, build_passed, tests_passed, error_message
    FROM sessions
"#;

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, description, instructions, target_area, branch_name, conversation_id,
                working_directory, archive_name, unpacked_path, state,
                created_at, updated_at, started_at, completed_at, merged_at,
                files_created, files_modified, files_deleted,
                merged, validated, build_passed, tests_passed, error_message
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)
        "#,
        )
        .bind(&session.id)
        .bind(&session.description)
        .bind(&session.instructions)
        .bind(&session.target_area)
        .bind(&session.branch_name)
        .bind(&session.conversation_id)
        .bind(&session.working_directory)
        .bind(&session.archive_name)
        .bind(&session.unpacked_path)
        .bind(session.state.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.merged_at)
        .bind(session.files_created)
        .bind(session.files_modified)
        .bind(session.files_deleted)
        .bind(session.merged)
        .bind(session.validated)
        .bind(session.build_passed)
        .bind(session.tests_passed)
        .bind(&session.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!("{} WHERE id = ?1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn get_by_conversation_id(&self, conversation_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "{} WHERE conversation_id = ?1",
            SELECT_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn list(&self, limit: i64) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "{} ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                description = ?2, instructions = ?3, target_area = ?4, branch_name = ?5,
                conversation_id = ?6, working_directory = ?7, archive_name = ?8,
                unpacked_path = ?9, state = ?10, updated_at = ?11, started_at = ?12,
                completed_at = ?13, merged_at = ?14, files_created = ?15,
                files_modified = ?16, files_deleted = ?17, merged = ?18, validated = ?19,
                build_passed = ?20, tests_passed = ?21, error_message = ?22
            WHERE id = ?1
        "#,
        )
        .bind(&session.id)
        .bind(&session.description)
        .bind(&session.instructions)
        .bind(&session.target_area)
        .bind(&session.branch_name)
        .bind(&session.conversation_id)
        .bind(&session.working_directory)
        .bind(&session.archive_name)
        .bind(&session.unpacked_path)
        .bind(session.state.as_str())
        .bind(session.updated_at)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.merged_at)
        .bind(session.files_created)
        .bind(session.files_modified)
        .bind(session.files_deleted)
        .bind(session.merged)
        .bind(session.validated)
        .bind(session.build_passed)
        .bind(session.tests_passed)
        .bind(&session.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Session '{}' not found",
                session.id
            )));
        }
        Ok(())
    }
}
