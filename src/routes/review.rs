use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::response::{json_error, AppError};
use crate::services::memory_item::{self, ItemStoreError};
use crate::services::srs::{self, MemoryItem, Rating, SrsParams};
use crate::state::AppState;

#[derive(Serialize)]
struct SuccessResponse<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    learner_id: String,
    item_key: String,
    rating: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleResponse {
    item: MemoryItem,
    interval_days: f64,
    retrievability: f64,
    mastered: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueQuery {
    learner_id: String,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    due_total: i64,
    items: Vec<MemoryItem>,
}

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/schedule", post(schedule))
        .route("/queue", get(queue))
}

/// Rates one item: creates its scheduling row on first contact, runs the
/// scheduler, persists the advanced state.
async fn schedule(
    State(state): State<AppState>,
    Json(payload): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, AppError> {
    // Parse before ensure_item so a bad rating never creates a row.
    let Some(rating) = Rating::from_str(&payload.rating) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "rating must be one of fail, hard, good, easy",
        ));
    };

    let now = Utc::now();

    let item = memory_item::ensure_item(state.pool(), &payload.learner_id, &payload.item_key, now)
        .await
        .map_err(item_error)?;

    let params = SrsParams::default();
    let outcome = srs::schedule_item(&item, rating, now, &params);

    memory_item::save_item(state.pool(), &outcome.item)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    let mastered = srs::is_mastered(&outcome.item);

    Ok(Json(SuccessResponse {
        success: true,
        data: ScheduleResponse {
            item: outcome.item,
            interval_days: outcome.interval_days,
            retrievability: outcome.retrievability,
            mastered,
        },
    }))
}

async fn queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.learner_id.trim().is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
            "learnerId must not be empty",
        ));
    }

    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let now = Utc::now();

    let items = memory_item::due_items(state.pool(), &query.learner_id, now, limit)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;
    let due_total = memory_item::count_due_items(state.pool(), &query.learner_id, now)
        .await
        .map_err(|err| AppError::internal(err.to_string()))?;

    Ok(Json(SuccessResponse {
        success: true,
        data: QueueResponse { due_total, items },
    }))
}

fn item_error(err: ItemStoreError) -> AppError {
    match err {
        ItemStoreError::Validation(message) => {
            json_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
        }
        ItemStoreError::Sql(err) => AppError::internal(err.to_string()),
    }
}
