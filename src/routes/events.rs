use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::response::{json_error, AppError};
use crate::services::practice_event::{self, EventError, EventInput, PracticeEvent};
use crate::state::AppState;

#[derive(Serialize)]
struct SuccessResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEventRequest {
    learner_id: String,
    session_id: String,
    #[serde(flatten)]
    event: EventInput,
}

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/", post(log_event))
}

/// `data` is null when the event was validated but the store dropped it;
/// the practice flow carries on either way.
async fn log_event(
    State(state): State<AppState>,
    Json(payload): Json<LogEventRequest>,
) -> Result<Response, AppError> {
    let event = practice_event::log_event(
        state.pool(),
        &payload.learner_id,
        &payload.session_id,
        &payload.event,
        Utc::now(),
    )
    .await
    .map_err(event_error)?;

    let response = match event {
        Some(event) => (
            StatusCode::CREATED,
            Json(SuccessResponse {
                success: true,
                data: Some(event),
            }),
        )
            .into_response(),
        None => Json(SuccessResponse {
            success: true,
            data: None::<PracticeEvent>,
        })
        .into_response(),
    };

    Ok(response)
}

fn event_error(err: EventError) -> AppError {
    match err {
        EventError::Validation(message) => {
            json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
        EventError::SessionNotFound(id) => json_error(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("session does not exist: {id}"),
        ),
        EventError::Sql(err) => AppError::internal(err.to_string()),
    }
}
