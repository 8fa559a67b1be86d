use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{format_timestamp, parse_timestamp_opt};
use crate::services::srs::{ItemState, MemoryItem, MASTERY_MAX_LAPSES, MASTERY_STABILITY_DAYS};

#[derive(Debug, Error)]
pub enum ItemStoreError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

/// Fetches the scheduling state for `(learner_id, item_key)`, creating an
/// untouched `new` row first if none exists. Concurrent callers race on the
/// insert; the unique index makes the loser's insert a no-op and both read
/// back the same row.
pub async fn ensure_item(
    pool: &SqlitePool,
    learner_id: &str,
    item_key: &str,
    now: DateTime<Utc>,
) -> Result<MemoryItem, ItemStoreError> {
    if learner_id.trim().is_empty() {
        return Err(ItemStoreError::Validation(
            "learnerId must not be empty".to_string(),
        ));
    }
    if item_key.trim().is_empty() {
        return Err(ItemStoreError::Validation(
            "itemKey must not be empty".to_string(),
        ));
    }

    let id = Uuid::new_v4().to_string();
    let now_str = format_timestamp(now);

    sqlx::query(
        r#"
        INSERT INTO "memory_items"
            ("id", "learnerId", "itemKey", "state", "stability", "difficulty",
             "reps", "lapses", "due", "createdAt", "updatedAt")
        VALUES (?, ?, ?, 'new', 0, 0, 0, 0, ?, ?, ?)
        ON CONFLICT ("learnerId", "itemKey") DO NOTHING
        "#,
    )
    .bind(&id)
    .bind(learner_id)
    .bind(item_key)
    .bind(&now_str)
    .bind(&now_str)
    .bind(&now_str)
    .execute(pool)
    .await?;

    let item = get_item(pool, learner_id, item_key)
        .await?
        .ok_or(ItemStoreError::Sql(sqlx::Error::RowNotFound))?;

    Ok(item)
}

pub async fn get_item(
    pool: &SqlitePool,
    learner_id: &str,
    item_key: &str,
) -> Result<Option<MemoryItem>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "id", "learnerId", "itemKey", "state", "stability", "difficulty",
               "reps", "lapses", "due", "lastReview", "createdAt", "updatedAt"
        FROM "memory_items"
        WHERE "learnerId" = ? AND "itemKey" = ?
        "#,
    )
    .bind(learner_id)
    .bind(item_key)
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_item(&r)).transpose()
}

pub async fn save_item(pool: &SqlitePool, item: &MemoryItem) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE "memory_items"
        SET "state" = ?, "stability" = ?, "difficulty" = ?, "reps" = ?,
            "lapses" = ?, "due" = ?, "lastReview" = ?, "updatedAt" = ?
        WHERE "id" = ?
        "#,
    )
    .bind(item.state.as_str())
    .bind(item.stability)
    .bind(item.difficulty)
    .bind(item.reps)
    .bind(item.lapses)
    .bind(format_timestamp(item.due))
    .bind(item.last_review.map(format_timestamp))
    .bind(format_timestamp(item.updated_at))
    .bind(&item.id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn count_tracked_items(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(r#"SELECT COUNT(*) FROM "memory_items" WHERE "learnerId" = ?"#)
        .bind(learner_id)
        .fetch_one(pool)
        .await
}

pub async fn count_due_items(
    pool: &SqlitePool,
    learner_id: &str,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"SELECT COUNT(*) FROM "memory_items" WHERE "learnerId" = ? AND "due" <= ?"#,
    )
    .bind(learner_id)
    .bind(format_timestamp(now))
    .fetch_one(pool)
    .await
}

/// Items whose due date has passed, most overdue first.
pub async fn due_items(
    pool: &SqlitePool,
    learner_id: &str,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<MemoryItem>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT "id", "learnerId", "itemKey", "state", "stability", "difficulty",
               "reps", "lapses", "due", "lastReview", "createdAt", "updatedAt"
        FROM "memory_items"
        WHERE "learnerId" = ? AND "due" <= ?
        ORDER BY "due" ASC
        LIMIT ?
        "#,
    )
    .bind(learner_id)
    .bind(format_timestamp(now))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_item).collect()
}

pub async fn mastered_item_keys(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT "itemKey" FROM "memory_items"
        WHERE "learnerId" = ? AND "stability" >= ? AND "lapses" <= ?
        "#,
    )
    .bind(learner_id)
    .bind(MASTERY_STABILITY_DAYS)
    .bind(MASTERY_MAX_LAPSES)
    .fetch_all(pool)
    .await
}

fn row_to_item(row: &SqliteRow) -> Result<MemoryItem, sqlx::Error> {
    let state_str: String = row.try_get("state").unwrap_or_else(|_| "new".to_string());

    Ok(MemoryItem {
        id: row.try_get("id")?,
        learner_id: row.try_get("learnerId")?,
        item_key: row.try_get("itemKey")?,
        state: ItemState::from_str(&state_str),
        stability: row.try_get("stability").unwrap_or(0.0),
        difficulty: row.try_get("difficulty").unwrap_or(0.0),
        reps: row.try_get("reps").unwrap_or(0),
        lapses: row.try_get("lapses").unwrap_or(0),
        due: parse_timestamp_opt(row.try_get("due").unwrap_or(None)).unwrap_or_else(Utc::now),
        last_review: parse_timestamp_opt(row.try_get("lastReview").unwrap_or(None)),
        created_at: parse_timestamp_opt(row.try_get("createdAt").unwrap_or(None))
            .unwrap_or_else(Utc::now),
        updated_at: parse_timestamp_opt(row.try_get("updatedAt").unwrap_or(None))
            .unwrap_or_else(Utc::now),
    })
}
