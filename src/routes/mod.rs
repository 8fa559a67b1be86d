use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;

use crate::response::json_error;
use crate::state::AppState;

mod events;
mod health;
mod recommendations;
mod review;
mod sessions;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/sessions", sessions::router())
        .nest("/api/events", events::router())
        .nest("/api/review", review::router())
        .nest("/api/recommendations", recommendations::router())
        .nest("/api/health", health::router())
        .nest("/health", health::router())
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "route does not exist")
}
