//! API-key rotation with per-key rate-limit cooldowns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

pub struct KeyPool {
    keys: Vec<String>,
    index: AtomicUsize,
    cooldowns: DashMap<String, Instant>,
    default_cooldown: Duration,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, default_cooldown_secs: u64) -> Self {
        Self {
            keys: keys.into_iter().filter(|k| !k.trim().is_empty()).collect(),
            index: AtomicUsize::new(0),
            cooldowns: DashMap::new(),
            default_cooldown: Duration::from_secs(default_cooldown_secs.max(1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Round-robin selection skipping cooled keys. When every key is cooling
    /// down, the one with the shortest remaining cooldown is forced.
    pub fn select(&self) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let now = Instant::now();
        let start = self.index.fetch_add(1, Ordering::Relaxed);

        for offset in 0..self.keys.len() {
            let key = &self.keys[(start + offset) % self.keys.len()];
            // Copy the deadline out before removing; a held shard ref
            // across remove() would deadlock.
            let cooldown_until = self.cooldowns.get(key).map(|entry| *entry.value());
            match cooldown_until {
                Some(until) if until > now => {
                    debug!(remaining_secs = (until - now).as_secs(), "api key cooling down, skipped");
                }
                Some(_) => {
                    self.cooldowns.remove(key);
                    debug!("api key cooldown expired, restored");
                    return Some(key.clone());
                }
                None => return Some(key.clone()),
            }
        }

        warn!("all api keys cooling down, forcing the one with shortest remaining cooldown");
        self.keys
            .iter()
            .min_by_key(|key| {
                self.cooldowns
                    .get(*key)
                    .map(|entry| *entry.value())
                    .unwrap_or(now)
            })
            .cloned()
    }

    /// Record a 429 for `key`. `retry_after_secs == 0` uses the default.
    pub fn mark_rate_limited(&self, key: &str, retry_after_secs: u64) {
        let cooldown = if retry_after_secs > 0 {
            Duration::from_secs(retry_after_secs)
        } else {
            self.default_cooldown
        };
        warn!(cooldown_secs = cooldown.as_secs(), "api key rate limited, cooling down");
        self.cooldowns
            .insert(key.to_string(), Instant::now() + cooldown);
    }

    #[cfg(test)]
    fn force_cooldown(&self, key: &str, until: Instant) {
        self.cooldowns.insert(key.to_string(), until);
    }
}
