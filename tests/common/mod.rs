#![allow(dead_code)]

use axum::Router;
use sqlx::SqlitePool;
use tempfile::TempDir;

use lingo_core::db::init_sqlite_pool;
use lingo_core::state::AppState;

/// Fresh migrated store on disk. The `TempDir` must stay alive for as long
/// as the pool is used.
pub async fn create_test_pool() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("test.db");
    let pool = init_sqlite_pool(db_path.to_str().expect("temp path is not utf-8"))
        .await
        .expect("failed to init test pool");
    (pool, dir)
}

pub async fn create_test_app() -> (Router, TempDir) {
    let (pool, dir) = create_test_pool().await;
    (lingo_core::create_app(AppState::new(pool)), dir)
}
