use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::response::{json_error, AppError};
use crate::services::recommendation::{self, RecommendationError};
use crate::state::AppState;

#[derive(Serialize)]
struct SuccessResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextQuery {
    learner_id: String,
    language: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvalidateRequest {
    learner_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvalidatedResponse {
    invalidated: bool,
}

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/next", get(next))
        .route("/invalidate", post(invalidate))
}

async fn next(
    State(state): State<AppState>,
    Query(query): Query<NextQuery>,
) -> Result<impl IntoResponse, AppError> {
    let recommendation = recommendation::next_activity(
        state.pool(),
        state.cache(),
        &query.learner_id,
        &query.language,
        Utc::now(),
    )
    .await
    .map_err(recommendation_error)?;

    Ok(Json(SuccessResponse {
        success: true,
        data: recommendation,
    }))
}

async fn invalidate(
    State(state): State<AppState>,
    Json(payload): Json<InvalidateRequest>,
) -> Result<impl IntoResponse, AppError> {
    if payload.learner_id.trim().is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "learnerId must not be empty",
        ));
    }

    recommendation::invalidate(state.cache(), &payload.learner_id);

    Ok(Json(SuccessResponse {
        success: true,
        data: InvalidatedResponse { invalidated: true },
    }))
}

fn recommendation_error(err: RecommendationError) -> AppError {
    match err {
        RecommendationError::Validation(message) => {
            json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
    }
}
