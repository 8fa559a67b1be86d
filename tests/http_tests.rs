//! HTTP surface tests: the full router driven through `tower::oneshot`
//! against a real migrated store.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    serde_json::from_slice(&bytes).expect("body is not JSON")
}

fn post_json(uri: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .expect("failed to build request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("failed to build request")
}

#[tokio::test]
async fn test_health_endpoints() {
    let (app, _dir) = common::create_test_app().await;

    let response = app.clone().oneshot(get("/health")).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["database"], json!("connected"));
    assert_eq!(body["status"], json!("ok"));

    let response = app.clone().oneshot(get("/health/info")).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["service"], json!("lingo-core"));

    let response = app.oneshot(get("/api/health")).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route_returns_json_404() {
    let (app, _dir) = common::create_test_app().await;

    let response = app.oneshot(get("/nonexistent/path")).await.expect("request failed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn test_full_practice_flow() {
    let (app, _dir) = common::create_test_app().await;

    // Start a flashcards session.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/sessions/start",
            &json!({"learnerId": "l1", "moduleSource": "flashcards"}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    let session_id = body["data"]["id"].as_str().expect("session id").to_string();

    // One correct answer.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/events",
            &json!({
                "learnerId": "l1",
                "sessionId": session_id,
                "itemKey": "perro",
                "moduleSource": "flashcards",
                "correct": true,
                "responseMs": 2100
            }),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["data"]["seq"], json!(1));
    assert_eq!(body["data"]["streak"], json!(0));
    assert!(body["data"]["timeOfDay"].is_string());

    // Rate the item.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/review/schedule",
            &json!({"learnerId": "l1", "itemKey": "perro", "rating": "good"}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["item"]["state"], json!("review"));
    assert_eq!(body["data"]["item"]["reps"], json!(1));
    assert_eq!(body["data"]["mastered"], json!(false));

    // Nothing due yet: the interval pushed the item out.
    let response = app
        .clone()
        .oneshot(get("/api/review/queue?learnerId=l1"))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["dueTotal"], json!(0));

    // Close the session.
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/sessions/end",
            &json!({"learnerId": "l1", "sessionId": session_id, "completed": true}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["totalItems"], json!(1));
    assert_eq!(body["data"]["correctItems"], json!(1));
    assert_eq!(body["data"]["completed"], json!(true));

    // Cold start continues down the priority list: flashcards was just
    // tried, so the next untried activity comes back.
    let response = app
        .oneshot(get("/api/recommendations/next?learnerId=l1&language=es"))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["reason"], json!("cold_start"));
    assert_eq!(body["data"]["activityType"], json!("cloze"));
    assert_eq!(body["data"]["targetRoute"], json!("/learn/es/cloze"));
    assert_eq!(body["data"]["urgency"], json!(30));
}

#[tokio::test]
async fn test_validation_errors_return_400() {
    let (app, _dir) = common::create_test_app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/sessions/start",
            &json!({"learnerId": "  ", "moduleSource": "flashcards"}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["code"], json!("VALIDATION_ERROR"));

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/events",
            &json!({
                "learnerId": "l1",
                "sessionId": "s1",
                "moduleSource": "flashcards",
                "correct": true,
                "responseMs": -5
            }),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json(
            "/api/events",
            &json!({
                "learnerId": "l1",
                "sessionId": "s1",
                "moduleSource": "dictation",
                "correct": true
            }),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], json!("VALIDATION_ERROR"));
}

#[tokio::test]
async fn test_unknown_session_returns_404() {
    let (app, _dir) = common::create_test_app().await;

    let response = app
        .oneshot(post_json(
            "/api/sessions/end",
            &json!({"learnerId": "l1", "sessionId": "no-such-session"}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], json!("SESSION_NOT_FOUND"));
}

#[tokio::test]
async fn test_schedule_rejects_an_unknown_rating() {
    let (app, _dir) = common::create_test_app().await;

    let response = app
        .oneshot(post_json(
            "/api/review/schedule",
            &json!({"learnerId": "l1", "itemKey": "perro", "rating": "amazing"}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["code"], json!("VALIDATION_ERROR"));
}

#[tokio::test]
async fn test_recommendations_next_requires_language() {
    let (app, _dir) = common::create_test_app().await;

    let response = app
        .oneshot(get("/api/recommendations/next?learnerId=l1"))
        .await
        .expect("request failed");
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_invalidate_acknowledges() {
    let (app, _dir) = common::create_test_app().await;

    let response = app
        .oneshot(post_json(
            "/api/recommendations/invalidate",
            &json!({"learnerId": "l1"}),
        ))
        .await
        .expect("request failed");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["invalidated"], json!(true));
}
