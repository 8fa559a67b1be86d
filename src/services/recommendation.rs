use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::warn;

use crate::cache::{self, keys, KeyValueCache};
use crate::db::parse_timestamp_opt;
use crate::services::baseline;
use crate::services::memory_item;

/// Cold-start priority order. `Review` is deliberately absent: with nothing
/// scheduled yet there is nothing to review.
pub const ACTIVITY_PRIORITY: [ActivityType; 7] = [
    ActivityType::Flashcards,
    ActivityType::Cloze,
    ActivityType::Pronunciation,
    ActivityType::Reading,
    ActivityType::Conjugation,
    ActivityType::Grammar,
    ActivityType::Conversation,
];

/// Modules where the learner must produce the answer instead of
/// recognizing it.
const PRODUCTION_MODULES: [&str; 3] = ["cloze", "conjugation", "conversation"];

const COLD_START_THRESHOLD: i64 = 20;
const DUE_RULE_MIN: i64 = 5;
const DUE_URGENT_THRESHOLD: i64 = 15;
const SKILL_WINDOW: i64 = 20;
const SKILL_MIN_ATTEMPTS: i64 = 5;
const SKILL_ERROR_THRESHOLD: i64 = 40;
const DEBT_MIN_SEEN: i64 = 3;
const DEBT_SCORE_CEILING: f64 = 40.0;
const DEBT_MIN_ITEMS: i64 = 8;
const PRONUNCIATION_GAP_DAYS: i64 = 3;
const PRONUNCIATION_LOW_SCORE: f64 = 10.0;
const CONVERSATION_GAP_DAYS: i64 = 4;
const COMFORTABLE_SCORE: f64 = 50.0;
const COMFORTABLE_MIN_ITEMS: i64 = 30;
const GRAMMAR_MASTERY_THRESHOLD: f64 = 0.5;
const STALE_SESSION_HOURS: i64 = 24;
const RECENT_REPEAT_HOURS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityType {
    Flashcards,
    Review,
    Cloze,
    Pronunciation,
    Reading,
    Conjugation,
    Grammar,
    Conversation,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flashcards => "flashcards",
            Self::Review => "review",
            Self::Cloze => "cloze",
            Self::Pronunciation => "pronunciation",
            Self::Reading => "reading",
            Self::Conjugation => "conjugation",
            Self::Grammar => "grammar",
            Self::Conversation => "conversation",
        }
    }

    pub fn from_module(module: &str) -> Option<Self> {
        match module.to_lowercase().as_str() {
            "flashcards" => Some(Self::Flashcards),
            "review" => Some(Self::Review),
            "cloze" => Some(Self::Cloze),
            "pronunciation" => Some(Self::Pronunciation),
            "reading" => Some(Self::Reading),
            "conjugation" => Some(Self::Conjugation),
            "grammar" => Some(Self::Grammar),
            "conversation" => Some(Self::Conversation),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Flashcards => "Flashcards",
            Self::Review => "Review",
            Self::Cloze => "Cloze practice",
            Self::Pronunciation => "Pronunciation practice",
            Self::Reading => "Reading",
            Self::Conjugation => "Conjugation drills",
            Self::Grammar => "Grammar exercises",
            Self::Conversation => "Conversation practice",
        }
    }

    pub fn estimated_minutes(&self) -> i64 {
        match self {
            Self::Flashcards | Self::Review | Self::Cloze => 10,
            Self::Pronunciation | Self::Conjugation => 10,
            Self::Reading | Self::Grammar => 15,
            Self::Conversation => 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub activity_type: ActivityType,
    pub target_route: String,
    pub urgency: i64,
    pub headline: String,
    pub subtext: String,
    pub estimated_minutes: i64,
    pub item_count: Option<i64>,
    pub reason: String,
}

/// Everything the cascade looks at, collapsed to plain values so the rules
/// stay pure. Time-dependent conditions are resolved while loading; the
/// default value is the degraded view used when the store is unreachable.
#[derive(Debug, Clone, Default)]
pub struct LearnerSnapshot {
    pub tracked_items: i64,
    pub due_count: i64,
    pub tried_modules: HashSet<String>,
    pub weak_skill: Option<WeakSkill>,
    pub practice_debt_items: i64,
    pub pronunciation_stale: bool,
    pub low_pronunciation_items: i64,
    pub conversation_stale: bool,
    pub comfortable_items: i64,
    pub weak_grammar: Option<WeakGrammar>,
    pub stale_learner: bool,
    pub recently_completed: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct WeakSkill {
    pub tag: String,
    pub attempts: i64,
    pub error_pct: i64,
    pub activity: ActivityType,
}

#[derive(Debug, Clone)]
pub struct WeakGrammar {
    pub tag: String,
    pub mastery: f64,
}

#[derive(Debug, Error)]
pub enum RecommendationError {
    #[error("Validation error: {0}")]
    Validation(String),
}

struct Rule {
    applies: fn(&LearnerSnapshot) -> bool,
    build: fn(&LearnerSnapshot, &str) -> Recommendation,
}

/// The cascade itself, highest priority first. The closing fallback rule
/// always applies, so evaluation is total.
static RULES: [Rule; 8] = [
    Rule {
        applies: cold_start_applies,
        build: build_cold_start,
    },
    Rule {
        applies: srs_due_applies,
        build: build_srs_due,
    },
    Rule {
        applies: skill_weakness_applies,
        build: build_skill_weakness,
    },
    Rule {
        applies: practice_debt_applies,
        build: build_practice_debt,
    },
    Rule {
        applies: modality_gap_applies,
        build: build_modality_gap,
    },
    Rule {
        applies: conversation_gap_applies,
        build: build_conversation_gap,
    },
    Rule {
        applies: grammar_gap_applies,
        build: build_grammar_gap,
    },
    Rule {
        applies: fallback_applies,
        build: build_fallback,
    },
];

fn cold_start_applies(s: &LearnerSnapshot) -> bool {
    s.tracked_items < COLD_START_THRESHOLD
}

fn srs_due_applies(s: &LearnerSnapshot) -> bool {
    s.due_count >= DUE_RULE_MIN
}

fn skill_weakness_applies(s: &LearnerSnapshot) -> bool {
    s.weak_skill.is_some()
}

fn practice_debt_applies(s: &LearnerSnapshot) -> bool {
    s.practice_debt_items >= DEBT_MIN_ITEMS
}

fn modality_gap_applies(s: &LearnerSnapshot) -> bool {
    s.pronunciation_stale && s.low_pronunciation_items > 0
}

fn conversation_gap_applies(s: &LearnerSnapshot) -> bool {
    s.conversation_stale && s.comfortable_items >= COMFORTABLE_MIN_ITEMS
}

fn grammar_gap_applies(s: &LearnerSnapshot) -> bool {
    s.weak_grammar.is_some()
}

fn fallback_applies(_: &LearnerSnapshot) -> bool {
    true
}

fn build_cold_start(s: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ACTIVITY_PRIORITY
        .iter()
        .copied()
        .find(|a| !s.tried_modules.contains(a.as_str()))
        .unwrap_or(ActivityType::Flashcards);

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency: 30,
        headline: format!("Get started with {}", activity.display_name()),
        subtext: format!(
            "You are tracking {} items so far. Short sessions grow that fast.",
            s.tracked_items
        ),
        estimated_minutes: activity.estimated_minutes(),
        item_count: None,
        reason: "cold_start".to_string(),
    }
}

fn build_srs_due(s: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ActivityType::Review;
    let urgent = s.due_count >= DUE_URGENT_THRESHOLD;
    let urgency = if urgent {
        95
    } else {
        (60 + 2 * s.due_count).min(100)
    };
    let (headline, subtext) = if urgent {
        (
            format!("{} items are slipping away", s.due_count),
            "Review them now before they fade for good.".to_string(),
        )
    } else {
        (
            format!("{} items ready for review", s.due_count),
            "A quick review will lock them in.".to_string(),
        )
    };

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency,
        headline,
        subtext,
        estimated_minutes: activity.estimated_minutes(),
        item_count: Some(s.due_count),
        reason: "srs_due".to_string(),
    }
}

fn build_skill_weakness(s: &LearnerSnapshot, language: &str) -> Recommendation {
    // The predicate guarantees the skill is present.
    let weak = s.weak_skill.clone().unwrap_or(WeakSkill {
        tag: "general".to_string(),
        attempts: 0,
        error_pct: SKILL_ERROR_THRESHOLD,
        activity: ActivityType::Cloze,
    });
    let urgency = (70 + (weak.error_pct - SKILL_ERROR_THRESHOLD)).min(100);

    Recommendation {
        activity_type: weak.activity,
        target_route: route_for(weak.activity, language),
        urgency,
        headline: format!("Sharpen your {}", weak.tag),
        subtext: format!(
            "You missed {}% of recent attempts on this skill.",
            weak.error_pct
        ),
        estimated_minutes: weak.activity.estimated_minutes(),
        item_count: None,
        reason: "skill_weakness".to_string(),
    }
}

fn build_practice_debt(s: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ActivityType::Cloze;

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency: 65,
        headline: "Time for active recall".to_string(),
        subtext: format!(
            "{} familiar items still trip you up when you have to produce them.",
            s.practice_debt_items
        ),
        estimated_minutes: activity.estimated_minutes(),
        item_count: Some(s.practice_debt_items),
        reason: "practice_debt".to_string(),
    }
}

fn build_modality_gap(_: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ActivityType::Pronunciation;

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency: 60,
        headline: "Give your pronunciation some attention".to_string(),
        subtext: "It has been a few days since you last practiced speaking.".to_string(),
        estimated_minutes: activity.estimated_minutes(),
        item_count: None,
        reason: "modality_gap".to_string(),
    }
}

fn build_conversation_gap(s: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ActivityType::Conversation;

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency: 55,
        headline: "Ready for a conversation?".to_string(),
        subtext: format!(
            "{} items are comfortable enough to use in a dialogue.",
            s.comfortable_items
        ),
        estimated_minutes: activity.estimated_minutes(),
        item_count: Some(s.comfortable_items),
        reason: "conversation_gap".to_string(),
    }
}

fn build_grammar_gap(s: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ActivityType::Grammar;
    let tag = s
        .weak_grammar
        .as_ref()
        .map(|w| w.tag.clone())
        .unwrap_or_else(|| "grammar".to_string());

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency: 50,
        headline: format!("Strengthen {}", tag),
        subtext: "Accuracy on this concept is still below half.".to_string(),
        estimated_minutes: activity.estimated_minutes(),
        item_count: None,
        reason: "grammar_gap".to_string(),
    }
}

fn build_fallback(_: &LearnerSnapshot, language: &str) -> Recommendation {
    let activity = ActivityType::Reading;

    Recommendation {
        activity_type: activity,
        target_route: route_for(activity, language),
        urgency: 40,
        headline: "Keep the momentum going".to_string(),
        subtext: "Open reading surfaces new words without pressure.".to_string(),
        estimated_minutes: activity.estimated_minutes(),
        item_count: None,
        reason: "fallback".to_string(),
    }
}

fn route_for(activity: ActivityType, language: &str) -> String {
    format!("/learn/{}/{}", language, activity.as_str())
}

pub fn evaluate_cascade(snapshot: &LearnerSnapshot, language: &str) -> Recommendation {
    for rule in &RULES {
        if (rule.applies)(snapshot) {
            return (rule.build)(snapshot, language);
        }
    }
    build_fallback(snapshot, language)
}

fn apply_boosts(base: i64, snapshot: &LearnerSnapshot, activity: ActivityType) -> i64 {
    let mut urgency = base;
    if snapshot.stale_learner {
        urgency += 10;
    }
    if snapshot.recently_completed.contains(activity.as_str()) {
        urgency -= 10;
    }
    urgency.clamp(0, 100)
}

/// Cascade plus boosts over an already-loaded snapshot.
pub fn recommend(snapshot: &LearnerSnapshot, language: &str) -> Recommendation {
    let mut recommendation = evaluate_cascade(snapshot, language);
    recommendation.urgency = apply_boosts(recommendation.urgency, snapshot, recommendation.activity_type);
    recommendation
}

/// Picks the next activity for a learner, consulting the per-learner cache
/// first. A snapshot that cannot be loaded degrades to the default view,
/// which lands on the cold-start or fallback rule instead of surfacing an
/// error to the learner.
pub async fn next_activity(
    pool: &SqlitePool,
    cache: &dyn KeyValueCache,
    learner_id: &str,
    language: &str,
    now: DateTime<Utc>,
) -> Result<Recommendation, RecommendationError> {
    if learner_id.trim().is_empty() {
        return Err(RecommendationError::Validation(
            "learnerId must not be empty".to_string(),
        ));
    }
    if language.trim().is_empty() {
        return Err(RecommendationError::Validation(
            "language must not be empty".to_string(),
        ));
    }

    let key = keys::next_activity_key(learner_id, language);
    if let Some(cached) = cache::get_json::<Recommendation>(cache, &key) {
        return Ok(cached);
    }

    let snapshot = match load_snapshot(pool, learner_id, now).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(
                error = %err,
                learner = %learner_id,
                "falling back to a degraded learner snapshot"
            );
            LearnerSnapshot::default()
        }
    };

    let recommendation = recommend(&snapshot, language);
    cache::set_json(cache, &key, &recommendation, keys::NEXT_ACTIVITY_TTL);

    Ok(recommendation)
}

/// Drops every cached recommendation for the learner, across languages.
pub fn invalidate(cache: &dyn KeyValueCache, learner_id: &str) {
    cache.delete_prefix(&keys::next_activity_prefix(learner_id));
}

pub async fn load_snapshot(
    pool: &SqlitePool,
    learner_id: &str,
    now: DateTime<Utc>,
) -> Result<LearnerSnapshot, sqlx::Error> {
    let tracked_items = memory_item::count_tracked_items(pool, learner_id).await?;
    let due_count = memory_item::count_due_items(pool, learner_id, now).await?;

    let tried: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT "moduleSource" FROM "practice_sessions" WHERE "learnerId" = ?
        UNION
        SELECT DISTINCT "moduleSource" FROM "practice_events" WHERE "learnerId" = ?
        "#,
    )
    .bind(learner_id)
    .bind(learner_id)
    .fetch_all(pool)
    .await?;

    let weak_skill = load_weak_skill(pool, learner_id).await?;
    let (practice_debt_items, low_pronunciation_items, mut comfortable) =
        load_item_scores(pool, learner_id).await?;
    comfortable.extend(memory_item::mastered_item_keys(pool, learner_id).await?);
    let weak_grammar = load_weak_grammar(pool, learner_id).await?;
    let last_completed = load_last_completed(pool, learner_id).await?;
    let learner_baseline = baseline::get_baseline(pool, learner_id).await?;

    let pronunciation_stale = last_completed
        .get(ActivityType::Pronunciation.as_str())
        .map_or(true, |t| now - *t > Duration::days(PRONUNCIATION_GAP_DAYS));
    let conversation_stale = last_completed
        .get(ActivityType::Conversation.as_str())
        .map_or(true, |t| now - *t > Duration::days(CONVERSATION_GAP_DAYS));
    let recently_completed = last_completed
        .iter()
        .filter(|(_, ended)| now - **ended <= Duration::hours(RECENT_REPEAT_HOURS))
        .map(|(module, _)| module.clone())
        .collect();
    let stale_learner = match &learner_baseline {
        None => true,
        Some(b) => match b.last_session_at {
            None => true,
            Some(t) => now - t > Duration::hours(STALE_SESSION_HOURS),
        },
    };

    Ok(LearnerSnapshot {
        tracked_items,
        due_count,
        tried_modules: tried.into_iter().collect(),
        weak_skill,
        practice_debt_items,
        pronunciation_stale,
        low_pronunciation_items,
        conversation_stale,
        comfortable_items: comfortable.len() as i64,
        weak_grammar,
        stale_learner,
        recently_completed,
    })
}

#[derive(Default)]
struct TagStats {
    attempts: i64,
    errors: i64,
    modules: HashMap<String, i64>,
}

impl TagStats {
    fn dominant_module(&self) -> Option<String> {
        self.modules
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(module, _)| module.clone())
    }
}

/// Weakest skill over the most recent tagged answers: at least
/// `SKILL_MIN_ATTEMPTS` tries and an error rate at or past the threshold.
async fn load_weak_skill(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<Option<WeakSkill>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT "skillTag", "moduleSource", "correct"
        FROM "practice_events"
        WHERE "learnerId" = ? AND "skillTag" IS NOT NULL
        ORDER BY "occurredAt" DESC
        LIMIT ?
        "#,
    )
    .bind(learner_id)
    .bind(SKILL_WINDOW)
    .fetch_all(pool)
    .await?;

    let mut per_tag: HashMap<String, TagStats> = HashMap::new();
    for row in &rows {
        let tag: String = match row.try_get("skillTag") {
            Ok(tag) => tag,
            Err(_) => continue,
        };
        let module: String = row.try_get("moduleSource").unwrap_or_default();
        let correct: i64 = row.try_get("correct").unwrap_or(0);

        let stats = per_tag.entry(tag).or_default();
        stats.attempts += 1;
        if correct == 0 {
            stats.errors += 1;
        }
        *stats.modules.entry(module).or_insert(0) += 1;
    }

    let mut candidates: Vec<WeakSkill> = per_tag
        .into_iter()
        .filter_map(|(tag, stats)| {
            if stats.attempts < SKILL_MIN_ATTEMPTS {
                return None;
            }
            let error_pct =
                (stats.errors as f64 / stats.attempts as f64 * 100.0).round() as i64;
            if error_pct < SKILL_ERROR_THRESHOLD {
                return None;
            }
            let activity = stats
                .dominant_module()
                .and_then(|module| ActivityType::from_module(&module))
                .unwrap_or(ActivityType::Cloze);
            Some(WeakSkill {
                tag,
                attempts: stats.attempts,
                error_pct,
                activity,
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.error_pct
            .cmp(&a.error_pct)
            .then(b.attempts.cmp(&a.attempts))
            .then(a.tag.cmp(&b.tag))
    });

    Ok(candidates.into_iter().next())
}

/// Per-item production and pronunciation scores, folded straight into the
/// three aggregates the cascade needs: practice-debt count, near-zero
/// pronunciation count, and the production-comfortable item set. An item
/// seen often with no production attempts at all counts as debt.
async fn load_item_scores(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<(i64, i64, HashSet<String>), sqlx::Error> {
    let production_list = PRODUCTION_MODULES
        .iter()
        .map(|module| format!("'{}'", module))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        r#"
        SELECT "itemKey",
               COUNT(*) AS "seen",
               SUM(CASE WHEN "moduleSource" IN ({list}) THEN 1 ELSE 0 END) AS "prodAttempts",
               SUM(CASE WHEN "moduleSource" IN ({list}) AND "correct" = 1 THEN 1 ELSE 0 END) AS "prodCorrect",
               SUM(CASE WHEN "moduleSource" = 'pronunciation' THEN 1 ELSE 0 END) AS "pronAttempts",
               SUM(CASE WHEN "moduleSource" = 'pronunciation' AND "correct" = 1 THEN 1 ELSE 0 END) AS "pronCorrect"
        FROM "practice_events"
        WHERE "learnerId" = ? AND "itemKey" IS NOT NULL
        GROUP BY "itemKey"
        "#,
        list = production_list
    );

    let rows = sqlx::query(&sql).bind(learner_id).fetch_all(pool).await?;

    let mut debt = 0i64;
    let mut low_pronunciation = 0i64;
    let mut comfortable = HashSet::new();

    for row in &rows {
        let item_key: String = row.try_get("itemKey")?;
        let seen: i64 = row.try_get("seen").unwrap_or(0);
        let prod_attempts: i64 = row.try_get("prodAttempts").unwrap_or(0);
        let prod_correct: i64 = row.try_get("prodCorrect").unwrap_or(0);
        let pron_attempts: i64 = row.try_get("pronAttempts").unwrap_or(0);
        let pron_correct: i64 = row.try_get("pronCorrect").unwrap_or(0);

        let production_score = percent(prod_correct, prod_attempts);
        if seen >= DEBT_MIN_SEEN && production_score.unwrap_or(0.0) < DEBT_SCORE_CEILING {
            debt += 1;
        }
        if let Some(score) = production_score {
            if score >= COMFORTABLE_SCORE {
                comfortable.insert(item_key);
            }
        }
        if let Some(score) = percent(pron_correct, pron_attempts) {
            if score < PRONUNCIATION_LOW_SCORE {
                low_pronunciation += 1;
            }
        }
    }

    Ok((debt, low_pronunciation, comfortable))
}

async fn load_weak_grammar(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<Option<WeakGrammar>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT "skillTag" AS "tag",
               COUNT(*) AS "attempts",
               SUM(CASE WHEN "correct" = 1 THEN 1 ELSE 0 END) AS "corrects"
        FROM "practice_events"
        WHERE "learnerId" = ? AND "moduleSource" = 'grammar' AND "skillTag" IS NOT NULL
        GROUP BY "skillTag"
        "#,
    )
    .bind(learner_id)
    .fetch_all(pool)
    .await?;

    let mut weakest: Option<WeakGrammar> = None;
    for row in &rows {
        let tag: String = row.try_get("tag")?;
        let attempts: i64 = row.try_get("attempts").unwrap_or(0);
        let corrects: i64 = row.try_get("corrects").unwrap_or(0);
        if attempts == 0 {
            continue;
        }
        let mastery = corrects as f64 / attempts as f64;
        if mastery >= GRAMMAR_MASTERY_THRESHOLD {
            continue;
        }
        let weaker = match &weakest {
            None => true,
            Some(current) => {
                mastery < current.mastery || (mastery == current.mastery && tag < current.tag)
            }
        };
        if weaker {
            weakest = Some(WeakGrammar { tag, mastery });
        }
    }

    Ok(weakest)
}

/// Latest finished session per module. Text timestamps sort the same as
/// their instants, so MAX works directly on the column.
async fn load_last_completed(
    pool: &SqlitePool,
    learner_id: &str,
) -> Result<HashMap<String, DateTime<Utc>>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT "moduleSource", MAX("endedAt") AS "lastEnded"
        FROM "practice_sessions"
        WHERE "learnerId" = ? AND "completed" = 1 AND "endedAt" IS NOT NULL
        GROUP BY "moduleSource"
        "#,
    )
    .bind(learner_id)
    .fetch_all(pool)
    .await?;

    let mut map = HashMap::new();
    for row in &rows {
        let module: String = row.try_get("moduleSource")?;
        if let Some(ended) = parse_timestamp_opt(row.try_get("lastEnded").unwrap_or(None)) {
            map.insert(module, ended);
        }
    }

    Ok(map)
}

fn percent(correct: i64, attempts: i64) -> Option<f64> {
    if attempts <= 0 {
        return None;
    }
    Some(correct as f64 / attempts as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> LearnerSnapshot {
        LearnerSnapshot {
            tracked_items: 25,
            ..Default::default()
        }
    }

    #[test]
    fn test_cold_start_picks_first_untried_activity() {
        let mut s = snapshot();
        s.tracked_items = 3;
        s.tried_modules.insert("flashcards".to_string());

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "cold_start");
        assert_eq!(rec.activity_type, ActivityType::Cloze);
        assert_eq!(rec.urgency, 30);
        assert_eq!(rec.target_route, "/learn/es/cloze");
    }

    #[test]
    fn test_cold_start_with_everything_tried_still_recommends() {
        let mut s = snapshot();
        s.tracked_items = 3;
        for activity in ACTIVITY_PRIORITY {
            s.tried_modules.insert(activity.as_str().to_string());
        }

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "cold_start");
        assert_eq!(rec.activity_type, ActivityType::Flashcards);
    }

    #[test]
    fn test_new_learner_scenario_matches_expected_shape() {
        let mut s = snapshot();
        s.tracked_items = 3;

        let rec = recommend(&s, "es");
        assert_eq!(rec.activity_type, ActivityType::Flashcards);
        assert_eq!(rec.reason, "cold_start");
        assert_eq!(rec.urgency, 30);
    }

    #[test]
    fn test_heavy_due_load_hits_the_urgent_branch() {
        let mut s = snapshot();
        s.due_count = 16;

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "srs_due");
        assert_eq!(rec.activity_type, ActivityType::Review);
        assert_eq!(rec.urgency, 95);
        assert_eq!(rec.item_count, Some(16));
        assert!(
            rec.headline.contains("slipping away"),
            "urgent headline should change tone, got: {}",
            rec.headline
        );
    }

    #[test]
    fn test_moderate_due_load_scales_urgency() {
        let mut s = snapshot();
        s.due_count = 7;

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "srs_due");
        assert_eq!(rec.urgency, 74, "60 + 2 * 7");
        assert!(rec.headline.contains("ready for review"));
    }

    #[test]
    fn test_due_rule_needs_five_items() {
        let mut s = snapshot();
        s.due_count = 4;

        let rec = recommend(&s, "es");
        assert_ne!(rec.reason, "srs_due");
    }

    #[test]
    fn test_skill_weakness_urgency_tracks_error_rate() {
        let mut s = snapshot();
        s.weak_skill = Some(WeakSkill {
            tag: "ser-vs-estar".to_string(),
            attempts: 8,
            error_pct: 55,
            activity: ActivityType::Conjugation,
        });

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "skill_weakness");
        assert_eq!(rec.activity_type, ActivityType::Conjugation);
        assert_eq!(rec.urgency, 85, "70 + (55 - 40)");
        assert!(rec.headline.contains("ser-vs-estar"));
    }

    #[test]
    fn test_skill_weakness_urgency_caps_at_one_hundred() {
        let mut s = snapshot();
        s.weak_skill = Some(WeakSkill {
            tag: "subjunctive".to_string(),
            attempts: 6,
            error_pct: 100,
            activity: ActivityType::Grammar,
        });

        let rec = recommend(&s, "es");
        assert_eq!(rec.urgency, 100);
    }

    #[test]
    fn test_practice_debt_needs_eight_items() {
        let mut s = snapshot();
        s.practice_debt_items = 7;
        let rec = recommend(&s, "es");
        assert_ne!(rec.reason, "practice_debt");

        s.practice_debt_items = 8;
        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "practice_debt");
        assert_eq!(rec.activity_type, ActivityType::Cloze);
        assert_eq!(rec.urgency, 65);
    }

    #[test]
    fn test_modality_gap_needs_staleness_and_a_weak_item() {
        let mut s = snapshot();
        s.pronunciation_stale = true;
        let rec = recommend(&s, "es");
        assert_ne!(rec.reason, "modality_gap", "no weak item yet");

        s.low_pronunciation_items = 1;
        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "modality_gap");
        assert_eq!(rec.activity_type, ActivityType::Pronunciation);
        assert_eq!(rec.urgency, 60);

        s.pronunciation_stale = false;
        let rec = recommend(&s, "es");
        assert_ne!(rec.reason, "modality_gap", "recent practice clears the gap");
    }

    #[test]
    fn test_conversation_gap_needs_thirty_comfortable_items() {
        let mut s = snapshot();
        s.conversation_stale = true;
        s.comfortable_items = 29;
        let rec = recommend(&s, "es");
        assert_ne!(rec.reason, "conversation_gap");

        s.comfortable_items = 30;
        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "conversation_gap");
        assert_eq!(rec.activity_type, ActivityType::Conversation);
        assert_eq!(rec.urgency, 55);
    }

    #[test]
    fn test_grammar_gap_names_the_weak_concept() {
        let mut s = snapshot();
        s.weak_grammar = Some(WeakGrammar {
            tag: "past-perfect".to_string(),
            mastery: 0.25,
        });

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "grammar_gap");
        assert_eq!(rec.activity_type, ActivityType::Grammar);
        assert_eq!(rec.urgency, 50);
        assert!(rec.headline.contains("past-perfect"));
    }

    #[test]
    fn test_fallback_fires_when_nothing_else_does() {
        let s = snapshot();
        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "fallback");
        assert_eq!(rec.activity_type, ActivityType::Reading);
        assert_eq!(rec.urgency, 40);
    }

    #[test]
    fn test_exactly_one_rule_fires_for_any_snapshot() {
        let shapes = [
            LearnerSnapshot::default(),
            snapshot(),
            LearnerSnapshot {
                tracked_items: 100,
                due_count: 50,
                practice_debt_items: 50,
                comfortable_items: 50,
                conversation_stale: true,
                pronunciation_stale: true,
                low_pronunciation_items: 5,
                ..Default::default()
            },
        ];
        for s in &shapes {
            let fired: Vec<usize> = RULES
                .iter()
                .enumerate()
                .filter(|(_, rule)| (rule.applies)(s))
                .map(|(idx, _)| idx)
                .collect();
            assert!(!fired.is_empty(), "the fallback must always apply");
            let rec = evaluate_cascade(s, "es");
            let first = (RULES[fired[0]].build)(s, "es");
            assert_eq!(rec.reason, first.reason, "first matching rule must win");
        }
    }

    #[test]
    fn test_stale_learner_boost_raises_urgency() {
        let mut s = snapshot();
        s.stale_learner = true;

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "fallback");
        assert_eq!(rec.urgency, 50, "40 + 10 staleness boost");
    }

    #[test]
    fn test_recent_repeat_penalty_lowers_urgency() {
        let mut s = snapshot();
        s.recently_completed.insert("reading".to_string());

        let rec = recommend(&s, "es");
        assert_eq!(rec.reason, "fallback");
        assert_eq!(rec.urgency, 30, "40 - 10 repeat penalty");
    }

    #[test]
    fn test_boosted_urgency_stays_clamped() {
        let mut s = snapshot();
        s.due_count = 40;
        s.stale_learner = true;

        let rec = recommend(&s, "es");
        assert_eq!(rec.urgency, 100, "95 + 10 must clamp to 100");
    }

    #[test]
    fn test_degraded_snapshot_lands_on_cold_start() {
        let rec = recommend(&LearnerSnapshot::default(), "es");
        assert_eq!(rec.reason, "cold_start");
    }
}
