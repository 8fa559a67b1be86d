use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::response::{json_error, AppError};
use crate::services::recommendation;
use crate::services::session::{self, SessionError};
use crate::state::AppState;

#[derive(Serialize)]
struct SuccessResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest {
    learner_id: String,
    module_source: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionRequest {
    learner_id: String,
    session_id: String,
    completed: Option<bool>,
}

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/start", post(start_session))
        .route("/end", post(end_session))
}

async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let summary = session::start_session(
        state.pool(),
        &payload.learner_id,
        &payload.module_source,
        Utc::now(),
    )
    .await
    .map_err(session_error)?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse {
            success: true,
            data: summary,
        }),
    ))
}

async fn end_session(
    State(state): State<AppState>,
    Json(payload): Json<EndSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let completed = payload.completed.unwrap_or(true);
    let summary = session::end_session(
        state.pool(),
        &payload.learner_id,
        &payload.session_id,
        completed,
        Utc::now(),
    )
    .await
    .map_err(session_error)?;

    // A finished session changes what the learner should do next.
    recommendation::invalidate(state.cache(), &payload.learner_id);

    Ok(Json(SuccessResponse {
        success: true,
        data: summary,
    }))
}

fn session_error(err: SessionError) -> AppError {
    match err {
        SessionError::Validation(message) => {
            json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
        SessionError::NotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("session does not exist: {id}"),
        ),
        SessionError::Sql(err) => AppError::internal(err.to_string()),
    }
}
