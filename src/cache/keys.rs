use std::time::Duration;

pub const NEXT_ACTIVITY_TTL: Duration = Duration::from_secs(5 * 60);

pub fn next_activity_key(learner_id: &str, language: &str) -> String {
    format!("learner:{}:next:{}", learner_id, language)
}

pub fn next_activity_prefix(learner_id: &str) -> String {
    format!("learner:{}:next:", learner_id)
}
