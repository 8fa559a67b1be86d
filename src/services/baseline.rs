use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::db::{format_timestamp, parse_timestamp_opt};

/// Seed average for a learner with no measured sessions yet.
pub const DEFAULT_AVG_RESPONSE_MS: f64 = 3000.0;

/// The smoothing window stops widening after this many sessions, so late
/// samples keep a fixed weight instead of vanishing.
const EMA_SESSION_CAP: i64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerBaseline {
    pub learner_id: String,
    pub avg_response_ms: f64,
    pub total_sessions: i64,
    pub last_session_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Exponential moving average over per-session mean response times. With
/// `total_sessions == 0` the smoothing factor is 1, so the first real
/// session replaces the seed value entirely.
pub fn next_baseline_average(old_avg: f64, total_sessions: i64, session_avg_ms: f64) -> f64 {
    let n = (total_sessions + 1).min(EMA_SESSION_CAP) as f64;
    let alpha = 2.0 / (n + 1.0);
    old_avg * (1.0 - alpha) + session_avg_ms * alpha
}

pub async fn get_baseline(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<Option<LearnerBaseline>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT "learnerId", "avgResponseMs", "totalSessions", "lastSessionAt",
               "createdAt", "updatedAt"
        FROM "learner_baselines"
        WHERE "learnerId" = ?
        "#,
    )
    .bind(learner_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_baseline(&r)).transpose()
}

pub async fn get_or_create_baseline(
    pool: &SqlitePool,
    learner_id: &str,
    now: DateTime<Utc>,
) -> Result<LearnerBaseline, sqlx::Error> {
    let now_str = format_timestamp(now);

    sqlx::query(
        r#"
        INSERT INTO "learner_baselines"
            ("learnerId", "avgResponseMs", "totalSessions", "createdAt", "updatedAt")
        VALUES (?, ?, 0, ?, ?)
        ON CONFLICT ("learnerId") DO NOTHING
        "#,
    )
    .bind(learner_id)
    .bind(DEFAULT_AVG_RESPONSE_MS)
    .bind(&now_str)
    .bind(&now_str)
    .execute(pool)
    .await?;

    get_baseline(pool, learner_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

/// Folds one finished session into the learner's baseline. Non-positive
/// samples are ignored, so the stored average stays above zero. The update
/// is conditional on the session count it read, so two sessions ending at
/// once cannot both apply against the same stale average; the loser retries
/// once and otherwise concedes the sample.
pub async fn update_baseline(
    pool: &SqlitePool,
    learner_id: &str,
    session_avg_ms: f64,
    now: DateTime<Utc>,
) -> Result<LearnerBaseline, sqlx::Error> {
    // With no prior sessions the blend replaces the seed outright, so a
    // zero sample would store a zero average.
    if session_avg_ms <= 0.0 {
        warn!(
            learner = %learner_id,
            sample = session_avg_ms,
            "ignoring baseline sample without a positive mean"
        );
        return get_or_create_baseline(pool, learner_id, now).await;
    }

    for _ in 0..2 {
        let current = get_or_create_baseline(pool, learner_id, now).await?;
        let new_avg =
            next_baseline_average(current.avg_response_ms, current.total_sessions, session_avg_ms);

        let result = sqlx::query(
            r#"
            UPDATE "learner_baselines"
            SET "avgResponseMs" = ?, "totalSessions" = "totalSessions" + 1,
                "lastSessionAt" = ?, "updatedAt" = ?
            WHERE "learnerId" = ? AND "totalSessions" = ?
            "#,
        )
        .bind(new_avg)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .bind(learner_id)
        .bind(current.total_sessions)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(LearnerBaseline {
                avg_response_ms: new_avg,
                total_sessions: current.total_sessions + 1,
                last_session_at: Some(now),
                updated_at: now,
                ..current
            });
        }
    }

    warn!(
        learner = %learner_id,
        "baseline update lost a concurrent race; keeping the stored value"
    );
    get_or_create_baseline(pool, learner_id, now).await
}

fn row_to_baseline(row: &SqliteRow) -> Result<LearnerBaseline, sqlx::Error> {
    Ok(LearnerBaseline {
        learner_id: row.try_get("learnerId")?,
        avg_response_ms: row
            .try_get("avgResponseMs")
            .unwrap_or(DEFAULT_AVG_RESPONSE_MS),
        total_sessions: row.try_get("totalSessions").unwrap_or(0),
        last_session_at: parse_timestamp_opt(row.try_get("lastSessionAt").unwrap_or(None)),
        created_at: parse_timestamp_opt(row.try_get("createdAt").unwrap_or(None))
            .unwrap_or_else(Utc::now),
        updated_at: parse_timestamp_opt(row.try_get("updatedAt").unwrap_or(None))
            .unwrap_or_else(Utc::now),
    })
}
