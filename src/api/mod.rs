pub mod sessions;
pub mod targets;

use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

/// Create the API router with all endpoint routes
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/targets", get(targets::list_targets))
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route("/sessions/:session_id", get(sessions::get_session))
        .route("/sessions/:session_id/upload", post(sessions::upload_archive))
        .route("/sessions/:session_id/start", post(sessions::start_session))
        .route("/sessions/:session_id/command", post(sessions::submit_command))
        .route("/sessions/:session_id/stop", post(sessions::stop_session))
        .route("/sessions/:session_id/resume", post(sessions::resume_session))
        .route("/sessions/:session_id/validate", post(sessions::validate_session))
        .route("/sessions/:session_id/merge", post(sessions::merge_session))
        .route("/sessions/:session_id/complete", post(sessions::complete_session))
        .route("/sessions/:session_id/rollback", post(sessions::rollback_session))
        .route("/sessions/:session_id/diff", get(sessions::get_diff))
        .route("/sessions/:session_id/changes", get(sessions::get_changes))
}
