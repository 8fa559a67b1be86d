use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::db::{format_timestamp, parse_timestamp_opt};
use crate::services::baseline;
use crate::services::recommendation::ActivityType;

/// How far back the in-session streak scan looks.
const STREAK_SCAN_LIMIT: i64 = 50;

const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    pub item_key: Option<String>,
    pub skill_tag: Option<String>,
    pub module_source: String,
    pub correct: bool,
    pub response_ms: Option<i64>,
}

/// One answer, enriched with the context features the recommendation
/// aggregates are built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PracticeEvent {
    pub id: String,
    pub learner_id: String,
    pub session_id: String,
    pub item_key: Option<String>,
    pub skill_tag: Option<String>,
    pub module_source: String,
    pub correct: bool,
    pub response_ms: Option<i64>,
    pub seq: i64,
    pub occurred_at: DateTime<Utc>,
    pub time_of_day: String,
    pub day_of_week: i32,
    pub days_since_last_review: Option<f64>,
    pub days_since_last_session: Option<f64>,
    pub streak: i32,
    pub fatigue_proxy: Option<f64>,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

pub fn validate_event_input(
    learner_id: &str,
    session_id: &str,
    input: &EventInput,
) -> Result<(), EventError> {
    if learner_id.trim().is_empty() {
        return Err(EventError::Validation(
            "learnerId must not be empty".to_string(),
        ));
    }
    if session_id.trim().is_empty() {
        return Err(EventError::Validation(
            "sessionId must not be empty".to_string(),
        ));
    }
    if input.module_source.trim().is_empty() {
        return Err(EventError::Validation(
            "moduleSource must not be empty".to_string(),
        ));
    }
    if ActivityType::from_module(&input.module_source).is_none() {
        return Err(EventError::Validation(format!(
            "unknown moduleSource: {}",
            input.module_source
        )));
    }
    if let Some(ms) = input.response_ms {
        if ms < 0 {
            return Err(EventError::Validation(
                "responseMs must not be negative".to_string(),
            ));
        }
    }
    Ok(())
}

pub fn time_of_day_bucket(hour: u32) -> &'static str {
    match hour {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=20 => "evening",
        _ => "night",
    }
}

/// Records one answer. Telemetry must never fail a practice flow, so any
/// store failure past input validation is logged and swallowed; the caller
/// gets `None` and the learner keeps practicing.
pub async fn log_event(
    pool: &SqlitePool,
    learner_id: &str,
    session_id: &str,
    input: &EventInput,
    now: DateTime<Utc>,
) -> Result<Option<PracticeEvent>, EventError> {
    validate_event_input(learner_id, session_id, input)?;

    match enrich_and_insert(pool, learner_id, session_id, input, now).await {
        Ok(event) => Ok(Some(event)),
        Err(EventError::Sql(err)) => {
            warn!(
                error = %err,
                learner = %learner_id,
                session = %session_id,
                "dropping practice event after store failure"
            );
            Ok(None)
        }
        Err(other) => Err(other),
    }
}

async fn enrich_and_insert(
    pool: &SqlitePool,
    learner_id: &str,
    session_id: &str,
    input: &EventInput,
    now: DateTime<Utc>,
) -> Result<PracticeEvent, EventError> {
    let session_owner: Option<String> =
        sqlx::query_scalar(r#"SELECT "learnerId" FROM "practice_sessions" WHERE "id" = ?"#)
            .bind(session_id)
            .fetch_optional(pool)
            .await?;

    let owner = session_owner.ok_or_else(|| EventError::SessionNotFound(session_id.to_string()))?;
    if owner != learner_id {
        return Err(EventError::Validation(
            "session belongs to a different learner".to_string(),
        ));
    }

    // The three context reads are independent of each other; only the
    // sequence claim below has to be ordered.
    let (learner_baseline, last_review, streak) = tokio::try_join!(
        baseline::get_or_create_baseline(pool, learner_id, now),
        item_last_review(pool, learner_id, input.item_key.as_deref()),
        session_streak(pool, session_id),
    )?;

    let seq = claim_sequence(pool, session_id)
        .await?
        .ok_or_else(|| EventError::SessionNotFound(session_id.to_string()))?;

    let days_since_last_review = last_review.map(|t| (now - t).num_milliseconds() as f64 / MS_PER_DAY);
    let days_since_last_session = learner_baseline
        .last_session_at
        .map(|t| (now - t).num_milliseconds() as f64 / MS_PER_DAY);
    let fatigue_proxy = match input.response_ms {
        Some(ms) if ms > 0 && learner_baseline.avg_response_ms > 0.0 => {
            Some(round2(ms as f64 / learner_baseline.avg_response_ms))
        }
        _ => None,
    };

    let event = PracticeEvent {
        id: Uuid::new_v4().to_string(),
        learner_id: learner_id.to_string(),
        session_id: session_id.to_string(),
        item_key: input.item_key.clone(),
        skill_tag: input.skill_tag.clone(),
        module_source: input.module_source.clone(),
        correct: input.correct,
        response_ms: input.response_ms,
        seq,
        occurred_at: now,
        time_of_day: time_of_day_bucket(now.hour()).to_string(),
        day_of_week: now.weekday().num_days_from_monday() as i32,
        days_since_last_review,
        days_since_last_session,
        streak,
        fatigue_proxy,
    };

    insert_event(pool, &event).await?;

    Ok(event)
}

/// Claims the next per-session sequence number. The store hands them out
/// atomically, so concurrent events in one session never collide even
/// though they arrive unordered.
async fn claim_sequence(pool: &SqlitePool, session_id: &str) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE "practice_sessions"
        SET "nextSeq" = "nextSeq" + 1
        WHERE "id" = ?
        RETURNING "nextSeq"
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("nextSeq")).transpose()
}

async fn item_last_review(
    pool: &SqlitePool,
    learner_id: &str,
    item_key: Option<&str>,
) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let Some(key) = item_key else {
        return Ok(None);
    };

    let raw: Option<Option<String>> = sqlx::query_scalar(
        r#"SELECT "lastReview" FROM "memory_items" WHERE "learnerId" = ? AND "itemKey" = ?"#,
    )
    .bind(learner_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(parse_timestamp_opt(raw.flatten()))
}

/// Consecutive correct answers at the tail of this session, counted from
/// the most recent event backwards and capped at `STREAK_SCAN_LIMIT`.
async fn session_streak(pool: &SqlitePool, session_id: &str) -> Result<i32, sqlx::Error> {
    let recent: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT "correct" FROM "practice_events"
        WHERE "sessionId" = ?
        ORDER BY "seq" DESC
        LIMIT ?
        "#,
    )
    .bind(session_id)
    .bind(STREAK_SCAN_LIMIT)
    .fetch_all(pool)
    .await?;

    let mut streak = 0;
    for correct in recent {
        if correct == 0 {
            break;
        }
        streak += 1;
    }
    Ok(streak)
}

async fn insert_event(pool: &SqlitePool, event: &PracticeEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO "practice_events"
            ("id", "learnerId", "sessionId", "itemKey", "skillTag", "moduleSource",
             "correct", "responseMs", "seq", "occurredAt", "timeOfDay", "dayOfWeek",
             "daysSinceLastReview", "daysSinceLastSession", "streak", "fatigueProxy")
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.learner_id)
    .bind(&event.session_id)
    .bind(&event.item_key)
    .bind(&event.skill_tag)
    .bind(&event.module_source)
    .bind(event.correct)
    .bind(event.response_ms)
    .bind(event.seq)
    .bind(format_timestamp(event.occurred_at))
    .bind(&event.time_of_day)
    .bind(event.day_of_week)
    .bind(event.days_since_last_review)
    .bind(event.days_since_last_session)
    .bind(event.streak)
    .bind(event.fatigue_proxy)
    .execute(pool)
    .await?;

    Ok(())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
