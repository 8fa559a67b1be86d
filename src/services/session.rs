use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::db::{format_timestamp, parse_timestamp_opt};
use crate::services::baseline;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub learner_id: String,
    pub module_source: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub total_items: i64,
    pub correct_items: i64,
    pub avg_response_ms: Option<f64>,
    pub distinct_items: i64,
    pub cognitive_load: Option<f64>,
    pub duration_seconds: i64,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

pub async fn start_session(
    pool: &SqlitePool,
    learner_id: &str,
    module_source: &str,
    now: DateTime<Utc>,
) -> Result<SessionSummary, SessionError> {
    if learner_id.trim().is_empty() {
        return Err(SessionError::Validation(
            "learnerId must not be empty".to_string(),
        ));
    }
    if module_source.trim().is_empty() {
        return Err(SessionError::Validation(
            "moduleSource must not be empty".to_string(),
        ));
    }

    let id = Uuid::new_v4().to_string();

    sqlx::query(
        r#"
        INSERT INTO "practice_sessions" ("id", "learnerId", "moduleSource", "startedAt")
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(learner_id)
    .bind(module_source)
    .bind(format_timestamp(now))
    .execute(pool)
    .await?;

    Ok(SessionSummary {
        id,
        learner_id: learner_id.to_string(),
        module_source: module_source.to_string(),
        started_at: now,
        ended_at: None,
        completed: false,
        total_items: 0,
        correct_items: 0,
        avg_response_ms: None,
        distinct_items: 0,
        cognitive_load: None,
        duration_seconds: 0,
    })
}

/// Finalizes a session by recomputing every aggregate from the stored
/// events, then folds the session's mean response time into the learner's
/// baseline. Expected to run once per session; a repeat call recomputes
/// the aggregates but also re-applies the baseline sample, so callers
/// should not retry blindly.
pub async fn end_session(
    pool: &SqlitePool,
    learner_id: &str,
    session_id: &str,
    completed: bool,
    now: DateTime<Utc>,
) -> Result<SessionSummary, SessionError> {
    if learner_id.trim().is_empty() {
        return Err(SessionError::Validation(
            "learnerId must not be empty".to_string(),
        ));
    }
    if session_id.trim().is_empty() {
        return Err(SessionError::Validation(
            "sessionId must not be empty".to_string(),
        ));
    }

    let header = sqlx::query(
        r#"
        SELECT "learnerId", "moduleSource", "startedAt", "endedAt"
        FROM "practice_sessions"
        WHERE "id" = ?
        "#,
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    let Some(header) = header else {
        return Err(SessionError::NotFound(session_id.to_string()));
    };

    let owner: String = header.try_get("learnerId")?;
    if owner != learner_id {
        return Err(SessionError::Validation(
            "session belongs to a different learner".to_string(),
        ));
    }

    let module_source: String = header.try_get("moduleSource")?;
    let started_at =
        parse_timestamp_opt(header.try_get("startedAt").unwrap_or(None)).unwrap_or(now);
    let already_ended = parse_timestamp_opt(header.try_get("endedAt").unwrap_or(None));
    if already_ended.is_some() {
        warn!(
            session = %session_id,
            learner = %learner_id,
            "session was already finalized; recomputing aggregates"
        );
    }

    let events = sqlx::query(
        r#"
        SELECT "correct", "responseMs", "itemKey", "fatigueProxy"
        FROM "practice_events"
        WHERE "sessionId" = ?
        ORDER BY "seq" ASC
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    let total_items = events.len() as i64;
    let mut correct_items = 0i64;
    let mut response_times: Vec<f64> = Vec::new();
    let mut fatigue_samples: Vec<f64> = Vec::new();
    let mut distinct: HashSet<String> = HashSet::new();

    for event in &events {
        let correct: i64 = event.try_get("correct").unwrap_or(0);
        if correct != 0 {
            correct_items += 1;
        }
        if let Ok(Some(ms)) = event.try_get::<Option<i64>, _>("responseMs") {
            response_times.push(ms as f64);
        }
        if let Ok(Some(key)) = event.try_get::<Option<String>, _>("itemKey") {
            distinct.insert(key);
        }
        if let Ok(Some(fatigue)) = event.try_get::<Option<f64>, _>("fatigueProxy") {
            fatigue_samples.push(fatigue);
        }
    }

    let avg_response_ms = mean(&response_times);
    let cognitive_load = mean(&fatigue_samples);
    let distinct_items = distinct.len() as i64;
    let duration_seconds = (now - started_at).num_seconds().max(0);

    sqlx::query(
        r#"
        UPDATE "practice_sessions"
        SET "endedAt" = ?, "completed" = ?, "totalItems" = ?, "correctItems" = ?,
            "avgResponseMs" = ?, "distinctItems" = ?, "cognitiveLoad" = ?,
            "durationSeconds" = ?
        WHERE "id" = ?
        "#,
    )
    .bind(format_timestamp(now))
    .bind(completed)
    .bind(total_items)
    .bind(correct_items)
    .bind(avg_response_ms)
    .bind(distinct_items)
    .bind(cognitive_load)
    .bind(duration_seconds)
    .bind(session_id)
    .execute(pool)
    .await?;

    if let Some(session_avg) = avg_response_ms {
        if let Err(err) = baseline::update_baseline(pool, learner_id, session_avg, now).await {
            warn!(
                error = %err,
                learner = %learner_id,
                "baseline update failed after session end"
            );
        }
    }

    Ok(SessionSummary {
        id: session_id.to_string(),
        learner_id: learner_id.to_string(),
        module_source,
        started_at,
        ended_at: Some(now),
        completed,
        total_items,
        correct_items,
        avg_response_ms,
        distinct_items,
        cognitive_load,
        duration_seconds,
    })
}

fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}
