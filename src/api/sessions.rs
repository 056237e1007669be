use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use serde_json::json;

use crate::{error::AppError, orchestrator::CreateSessionRequest, server::AppState};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub file_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub additional_instructions: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MergeRequest {
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub commit_ref: String,
}

/// POST /api/sessions - Create a session
pub async fn create_session(
    State(state): State<AppState>,
    payload: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let session = state.orchestrator.create_session(request).await?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions - Most recent sessions first
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let sessions = state.orchestrator.list_sessions(query.limit).await?;

    Ok((StatusCode::OK, Json(sessions)))
}

/// GET /api/sessions/:session_id - Session record plus agent liveness
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let status = state.orchestrator.status(&session_id).await?;

    Ok((StatusCode::OK, Json(status)))
}

/// POST /api/sessions/:session_id/upload - Raw zip body
pub async fn upload_archive(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Upload body is empty".to_string()));
    }
    let file_name = query.file_name.unwrap_or_else(|| "upload.zip".to_string());
    let result = state
        .orchestrator
        .upload_archive(&session_id, &file_name, &body)
        .await?;

    Ok((StatusCode::OK, Json(result)))
}

/// POST /api/sessions/:session_id/start
pub async fn start_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Option<Json<StartRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let session = state
        .orchestrator
        .start(&session_id, request.additional_instructions)
        .await?;

    Ok((StatusCode::OK, Json(session)))
}

/// POST /api/sessions/:session_id/command - Queue a prompt for the agent
pub async fn submit_command(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let receipt = state
        .orchestrator
        .submit_command(&session_id, &request.command)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// POST /api/sessions/:session_id/stop
pub async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.orchestrator.stop(&session_id).await?;

    Ok((StatusCode::OK, Json(session)))
}

/// POST /api/sessions/:session_id/resume
pub async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.orchestrator.resume(&session_id).await?;

    Ok((StatusCode::OK, Json(session)))
}

/// POST /api/sessions/:session_id/validate
pub async fn validate_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let result = state.orchestrator.validate(&session_id).await?;

    Ok((StatusCode::OK, Json(result)))
}

/// POST /api/sessions/:session_id/merge
pub async fn merge_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Option<Json<MergeRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let result = state
        .orchestrator
        .merge(&session_id, request.message)
        .await?;

    Ok((StatusCode::OK, Json(result)))
}

/// POST /api/sessions/:session_id/complete
pub async fn complete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let session = state.orchestrator.complete(&session_id).await?;

    Ok((StatusCode::OK, Json(session)))
}

/// POST /api/sessions/:session_id/rollback
pub async fn rollback_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    payload: Result<Json<RollbackRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let session = state
        .orchestrator
        .rollback(&session_id, &request.commit_ref)
        .await?;

    Ok((StatusCode::OK, Json(session)))
}

/// GET /api/sessions/:session_id/diff
pub async fn get_diff(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let diff = state.orchestrator.diff(&session_id).await?;

    Ok((StatusCode::OK, Json(json!({ "diff": diff }))))
}

/// GET /api/sessions/:session_id/changes
pub async fn get_changes(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let files = state.orchestrator.changed_files(&session_id).await?;

    Ok((StatusCode::OK, Json(files)))
}
