use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

use crate::{error::AppError, server::AppState};

/// GET /api/targets - Directories a session can be scoped to
pub async fn list_targets(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let targets = state.orchestrator.list_targets().await?;

    Ok((StatusCode::OK, Json(targets)))
}
