use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(root)).route("/info", get(info))
}

async fn root(State(state): State<AppState>) -> Response {
    let ok = sqlx::query("SELECT 1").execute(state.pool()).await.is_ok();

    let response = HealthResponse {
        database: if ok { "connected" } else { "disconnected" },
        timestamp: now_iso(),
        status: if ok { "ok" } else { "degraded" },
    };

    let status_code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(response)).into_response()
}

async fn info(State(state): State<AppState>) -> Response {
    let response = InfoResponse {
        service: "lingo-core",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.uptime_seconds(),
    };

    Json(response).into_response()
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Serialize)]
struct HealthResponse {
    database: &'static str,
    timestamp: String,
    status: &'static str,
}

#[derive(Serialize)]
struct InfoResponse {
    service: &'static str,
    version: &'static str,
    uptime: u64,
}
