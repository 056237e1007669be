use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A git, agent or build tool exited unsuccessfully. `output` carries the
    /// tool's combined stdout/stderr.
    #[error("{message}")]
    ExternalTool { message: String, output: String },

    #[error("Merge conflict in {}", .files.join(", "))]
    MergeConflict { files: Vec<String> },
}

impl AppError {
    pub fn external_tool(message: impl Into<String>, output: impl Into<String>) -> Self {
        AppError::ExternalTool {
            message: message.into(),
            output: output.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::Json(ref err) => (StatusCode::BAD_REQUEST, err.to_string()),
            AppError::Config(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::Io(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::InvalidState(ref message) => (StatusCode::CONFLICT, message.clone()),
            AppError::Internal(ref err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            AppError::ExternalTool {
                ref message,
                ref output,
            } => {
                let body = json!({
                    "error": message,
                    "output": output,
                });
                return (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(body)).into_response();
            }
            AppError::MergeConflict { .. } => (StatusCode::CONFLICT, self.to_string()),
        };

        let body = json!({
            "error": error_message
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for AppError {
    fn from(rej: axum::extract::rejection::JsonRejection) -> Self {
        AppError::BadRequest(rej.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_conflict_lists_files() {
        let err = AppError::MergeConflict {
            files: vec!["a.ts".to_string(), "b.ts".to_string()],
        };
        assert_eq!(err.to_string(), "Merge conflict in a.ts, b.ts");
    }

    #[test]
    fn status_codes() {
        let response = AppError::NotFound("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = AppError::InvalidState("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::external_tool("git failed", "fatal: bad").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
