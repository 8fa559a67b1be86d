use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const DECAY: f64 = -0.5;
const FACTOR: f64 = 19.0 / 81.0;

const TARGET_RETENTION: f64 = 0.9;
const MIN_STABILITY: f64 = 0.1;
const MAX_INTERVAL_DAYS: f64 = 36500.0;

/// Stability threshold (days) above which an item counts as mastered,
/// provided it has not lapsed more than twice.
pub const MASTERY_STABILITY_DAYS: f64 = 21.0;
pub const MASTERY_MAX_LAPSES: i32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrsParams {
    pub w: [f64; 17],
}

impl Default for SrsParams {
    fn default() -> Self {
        Self {
            w: [
                0.4, 0.6, 2.4, 5.8, // w0-w3: initial stability per rating
                4.93, 0.94, 0.86, 0.01, 1.49, // w4-w8
                0.14, 0.94, 2.18, 0.05, 0.34, // w9-w13
                1.26, 0.29, 2.61, // w14-w16
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Fail = 1,
    Hard = 2,
    Good = 3,
    Easy = 4,
}

impl Rating {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fail" => Some(Self::Fail),
            "hard" => Some(Self::Hard),
            "good" => Some(Self::Good),
            "easy" => Some(Self::Easy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    New,
    Learning,
    Review,
    Relearning,
}

impl Default for ItemState {
    fn default() -> Self {
        Self::New
    }
}

impl ItemState {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "learning" => Self::Learning,
            "review" => Self::Review,
            "relearning" => Self::Relearning,
            _ => Self::New,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Learning => "learning",
            Self::Review => "review",
            Self::Relearning => "relearning",
        }
    }
}

/// Persisted scheduling state for one (learner, item) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryItem {
    pub id: String,
    pub learner_id: String,
    pub item_key: String,
    pub state: ItemState,
    pub stability: f64,
    pub difficulty: f64,
    pub reps: i32,
    pub lapses: i32,
    pub due: DateTime<Utc>,
    pub last_review: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScheduleOutcome {
    pub item: MemoryItem,
    pub interval_days: f64,
    /// Recall probability at the moment the rating was given (1.0 for first
    /// exposures).
    pub retrievability: f64,
}

/// Probability the item is still recalled after `elapsed_days`, from the
/// power-law forgetting curve. Stability is defined as the age at which
/// recall drops to 90%, so `retrievability(s, s) == 0.9`.
pub fn retrievability(stability: f64, elapsed_days: f64) -> f64 {
    if stability <= 0.0 {
        return 0.0;
    }
    let safe_elapsed = elapsed_days.max(0.0);
    (1.0 + FACTOR * safe_elapsed / stability).powf(DECAY)
}

/// Pure scheduling transition: applies a rating to an item at `now` and
/// returns the updated item plus the chosen interval. Callers persist the
/// result; no I/O happens here.
pub fn schedule_item(
    item: &MemoryItem,
    rating: Rating,
    now: DateTime<Utc>,
    params: &SrsParams,
) -> ScheduleOutcome {
    let w = &params.w;
    let rating_val = rating as i32;
    let mut next = item.clone();

    let (recall_before, interval_days) = if item.state == ItemState::New {
        next.stability = initial_stability(w, rating_val);
        next.difficulty = initial_difficulty(w, rating_val);

        let interval = if rating == Rating::Fail {
            // First exposure was forgotten: nothing has been successfully
            // repeated yet, so reps stays 0 and the item re-enters today.
            next.state = ItemState::Learning;
            next.reps = 0;
            next.lapses = item.lapses + 1;
            0.0
        } else {
            next.state = ItemState::Review;
            next.reps = 1;
            next_interval(next.stability, TARGET_RETENTION)
        };
        (1.0, interval)
    } else {
        let elapsed = item
            .last_review
            .map(|last| (now - last).num_days().max(0) as f64)
            .unwrap_or(0.0);
        let recall = retrievability(item.stability, elapsed);
        next.difficulty = next_difficulty(w, item.difficulty, rating_val);

        let interval = if rating == Rating::Fail {
            next.stability = next_forget_stability(w, item.difficulty, item.stability, recall);
            next.lapses = item.lapses + 1;
            next.reps = 0;
            next.state = ItemState::Relearning;
            0.0
        } else {
            next.stability =
                next_recall_stability(w, item.difficulty, item.stability, recall, rating_val);
            next.reps = item.reps + 1;
            next.state = ItemState::Review;
            next_interval(next.stability, TARGET_RETENTION)
        };
        (recall, interval)
    };

    next.due = now + Duration::days(interval_days.round() as i64);
    next.last_review = Some(now);
    next.updated_at = now;

    ScheduleOutcome {
        item: next,
        interval_days,
        retrievability: recall_before,
    }
}

/// Long-term mastery predicate used by the recommendation cascade.
/// Relaxed condition: allows up to 2 lapses.
pub fn is_mastered(item: &MemoryItem) -> bool {
    item.stability >= MASTERY_STABILITY_DAYS && item.lapses <= MASTERY_MAX_LAPSES
}

fn initial_stability(w: &[f64; 17], rating: i32) -> f64 {
    w[(rating - 1) as usize].max(MIN_STABILITY)
}

fn initial_difficulty(w: &[f64; 17], rating: i32) -> f64 {
    let d = w[4] - (rating - 3) as f64 * w[5];
    d.clamp(1.0, 10.0)
}

fn next_difficulty(w: &[f64; 17], d: f64, rating: i32) -> f64 {
    let delta = -(rating - 3) as f64;
    let d_new = d + w[6] * delta;
    let d_mean = w[7] * (w[4] - 3.0 * w[5]) + (1.0 - w[7]) * d_new;
    d_mean.clamp(1.0, 10.0)
}

fn next_recall_stability(w: &[f64; 17], d: f64, s: f64, r: f64, rating: i32) -> f64 {
    let hard_penalty = if rating == 2 { w[15] } else { 1.0 };
    let easy_bonus = if rating == 4 { w[16] } else { 1.0 };

    let new_s = s
        * (1.0
            + w[8].exp()
                * (11.0 - d)
                * s.powf(-w[9])
                * ((1.0 - r) * w[10]).exp_m1()
                * hard_penalty
                * easy_bonus);
    new_s.max(MIN_STABILITY)
}

fn next_forget_stability(w: &[f64; 17], d: f64, s: f64, r: f64) -> f64 {
    let new_s = w[11] * d.powf(-w[12]) * ((s + 1.0).powf(w[13]) - 1.0) * (1.0 - r).powf(w[14]).exp();
    // Post-lapse stability never exceeds what the item had before.
    new_s.clamp(MIN_STABILITY, s.max(MIN_STABILITY))
}

fn next_interval(stability: f64, desired_retention: f64) -> f64 {
    let safe_retention = desired_retention.clamp(0.0001, 0.9999);
    let interval = stability / FACTOR * (safe_retention.powf(1.0 / DECAY) - 1.0);
    interval.clamp(1.0, MAX_INTERVAL_DAYS)
}
