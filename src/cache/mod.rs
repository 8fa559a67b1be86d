pub mod keys;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

const TTL_JITTER_RATIO: f64 = 0.1;

/// Narrow cache surface so callers never depend on the backing store.
/// The in-process map below is the only implementation today; a shared
/// backend can replace it without touching call sites.
pub trait KeyValueCache: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<String>;
    fn set_raw(&self, key: &str, payload: String, ttl: Duration);
    fn delete(&self, key: &str);
    fn delete_prefix(&self, prefix: &str);
}

struct CacheEntry {
    payload: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueCache for MemoryCache {
    fn get_raw(&self, key: &str) -> Option<String> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.payload.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired entries are evicted lazily on the next read.
        self.entries.write().remove(key);
        None
    }

    fn set_raw(&self, key: &str, payload: String, ttl: Duration) {
        let ttl = if ttl.is_zero() { ttl } else { apply_ttl_jitter(ttl) };
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                expires_at: now + ttl,
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn delete_prefix(&self, prefix: &str) {
        self.entries.write().retain(|key, _| !key.starts_with(prefix));
    }
}

pub fn get_json<T>(cache: &dyn KeyValueCache, key: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let payload = cache.get_raw(key)?;
    serde_json::from_str(&payload).ok()
}

pub fn set_json<T>(cache: &dyn KeyValueCache, key: &str, value: &T, ttl: Duration)
where
    T: Serialize,
{
    let payload = match serde_json::to_string(value) {
        Ok(p) => p,
        Err(_) => return,
    };
    cache.set_raw(key, payload, ttl);
}

fn apply_ttl_jitter(ttl: Duration) -> Duration {
    let base_ms = ttl.as_millis() as f64;
    let mut rng = rand::rng();
    let factor = rng.random_range(1.0 - TTL_JITTER_RATIO..=1.0 + TTL_JITTER_RATIO);
    let jittered_ms = (base_ms * factor).round().max(1.0);
    Duration::from_millis(jittered_ms as u64)
}
