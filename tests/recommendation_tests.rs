//! Recommendation cascade against a populated store, driven through the
//! public entry point with the per-learner cache in the loop.

mod common;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use lingo_core::cache::MemoryCache;
use lingo_core::services::baseline;
use lingo_core::services::memory_item;
use lingo_core::services::practice_event::{self, EventInput};
use lingo_core::services::recommendation::{self, ActivityType, RecommendationError};
use lingo_core::services::session;

fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Seeds `count` scheduling rows for the learner; the first `due_count` of
/// them are a day overdue, the rest a month out.
async fn seed_items(pool: &SqlitePool, learner: &str, count: usize, due_count: usize) {
    let t = now();
    for i in 0..count {
        let key = format!("item-{:03}", i);
        let mut item = memory_item::ensure_item(pool, learner, &key, t)
            .await
            .expect("ensure failed");
        item.due = if i < due_count {
            t - Duration::days(1)
        } else {
            t + Duration::days(30)
        };
        memory_item::save_item(pool, &item).await.expect("save failed");
    }
}

/// Marks the learner as recently active so the staleness boost stays out
/// of the urgency numbers.
async fn freshen_baseline(pool: &SqlitePool, learner: &str) {
    baseline::update_baseline(pool, learner, 2000.0, now())
        .await
        .expect("baseline update failed");
}

async fn log_tagged_events(
    pool: &SqlitePool,
    learner: &str,
    module: &str,
    skill_tag: Option<&str>,
    outcomes: &[(String, bool)],
) {
    let t = now();
    let started = session::start_session(pool, learner, module, t)
        .await
        .expect("start failed");
    for (item_key, correct) in outcomes {
        let input = EventInput {
            item_key: Some(item_key.clone()),
            skill_tag: skill_tag.map(|s| s.to_string()),
            module_source: module.to_string(),
            correct: *correct,
            response_ms: Some(2000),
        };
        practice_event::log_event(pool, learner, &started.id, &input, t)
            .await
            .expect("log failed")
            .expect("event must be stored");
    }
}

#[tokio::test]
async fn test_new_learner_is_sent_to_flashcards() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();
    seed_items(&pool, "l1", 3, 0).await;
    freshen_baseline(&pool, "l1").await;

    let rec = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");

    assert_eq!(rec.reason, "cold_start");
    assert_eq!(rec.activity_type, ActivityType::Flashcards);
    assert_eq!(rec.urgency, 30);
    assert_eq!(rec.target_route, "/learn/es/flashcards");
    assert_eq!(rec.estimated_minutes, 10);

    pool.close().await;
}

#[tokio::test]
async fn test_heavy_due_load_outranks_everything() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();
    seed_items(&pool, "l1", 25, 16).await;
    freshen_baseline(&pool, "l1").await;

    let rec = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");

    assert_eq!(rec.reason, "srs_due");
    assert_eq!(rec.activity_type, ActivityType::Review);
    assert_eq!(rec.urgency, 95);
    assert_eq!(rec.item_count, Some(16));
    assert!(rec.headline.contains("16"), "headline: {}", rec.headline);
    assert_eq!(rec.target_route, "/learn/es/review");

    pool.close().await;
}

#[tokio::test]
async fn test_weak_skill_drives_a_targeted_drill() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();
    seed_items(&pool, "l1", 20, 0).await;
    freshen_baseline(&pool, "l1").await;

    // Six recent conjugation attempts on one tag, four of them wrong.
    let outcomes: Vec<(String, bool)> = (0..6)
        .map(|i| (format!("conj-{}", i % 2), i >= 4))
        .collect();
    log_tagged_events(&pool, "l1", "conjugation", Some("ser-vs-estar"), &outcomes).await;

    let rec = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");

    assert_eq!(rec.reason, "skill_weakness");
    assert_eq!(rec.activity_type, ActivityType::Conjugation);
    assert_eq!(rec.urgency, 97, "70 + (67 - 40)");
    assert!(
        rec.headline.contains("ser-vs-estar"),
        "headline should name the skill, got: {}",
        rec.headline
    );

    pool.close().await;
}

#[tokio::test]
async fn test_practice_debt_prompts_active_recall() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();
    seed_items(&pool, "l1", 20, 0).await;
    freshen_baseline(&pool, "l1").await;

    // Eight items seen three times each, recognition only: produced answers
    // never attempted, so every one of them carries production debt.
    let mut outcomes = Vec::new();
    for i in 0..8 {
        for _ in 0..3 {
            outcomes.push((format!("debt-{}", i), true));
        }
    }
    log_tagged_events(&pool, "l1", "flashcards", None, &outcomes).await;

    let rec = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");

    assert_eq!(rec.reason, "practice_debt");
    assert_eq!(rec.activity_type, ActivityType::Cloze);
    assert_eq!(rec.urgency, 65);
    assert_eq!(rec.item_count, Some(8));

    pool.close().await;
}

#[tokio::test]
async fn test_recommendations_are_cached_until_invalidated() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();
    seed_items(&pool, "l1", 3, 0).await;
    freshen_baseline(&pool, "l1").await;

    let first = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");
    assert_eq!(first.reason, "cold_start");

    // The store moves on, the cache does not.
    for i in 100..133 {
        let mut item = memory_item::ensure_item(&pool, "l1", &format!("item-{}", i), now())
            .await
            .expect("ensure failed");
        item.due = now() + Duration::days(30);
        memory_item::save_item(&pool, &item).await.expect("save failed");
    }

    let second = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");
    assert_eq!(second.reason, "cold_start", "served from the cache");
    assert_eq!(second.activity_type, first.activity_type);

    recommendation::invalidate(&cache, "l1");

    let third = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("recommendation failed");
    assert_eq!(third.reason, "fallback", "recomputed against the grown store");
    assert_eq!(third.activity_type, ActivityType::Reading);

    pool.close().await;
}

#[tokio::test]
async fn test_unreachable_store_degrades_to_cold_start() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();
    pool.close().await;

    let rec = recommendation::next_activity(&pool, &cache, "l1", "es", now())
        .await
        .expect("a dead store must not surface an error");

    assert_eq!(rec.reason, "cold_start");
    assert_eq!(rec.activity_type, ActivityType::Flashcards);
    assert_eq!(rec.urgency, 30);
}

#[tokio::test]
async fn test_blank_parameters_are_validation_errors() {
    let (pool, _dir) = common::create_test_pool().await;
    let cache = MemoryCache::new();

    let err = recommendation::next_activity(&pool, &cache, "  ", "es", now())
        .await
        .expect_err("blank learner must be rejected");
    assert!(matches!(err, RecommendationError::Validation(_)));

    let err = recommendation::next_activity(&pool, &cache, "l1", "", now())
        .await
        .expect_err("blank language must be rejected");
    assert!(matches!(err, RecommendationError::Validation(_)));

    pool.close().await;
}
