//! Tool execution with a TTL+LRU result cache and in-flight deduplication.
//!
//! The TTL cache only ever serves the known idempotent tools and only when
//! a stable session scope exists. In-flight dedupe always applies per key,
//! so identical concurrent calls run the handler exactly once. Cache and
//! inflight map are independent structures so TTL pruning stays off the
//! dedupe path.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::debug;

use crate::error::ToolError;

/// Tools safe to serve from cache: read-only / query-like.
pub fn is_cacheable_tool(tool_name: &str) -> bool {
    matches!(
        tool_name.trim(),
        "web_search" | "search_group_history" | "search_knowledge" | "fetch_history_images"
    )
}

/// Canonical argument encoding: serde_json maps iterate sorted by key, so
/// serialization is already order-stable.
pub fn normalize_args(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_else(|_| args.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutcome {
    pub result: String,
    pub cache_hit: bool,
    pub inflight_deduped: bool,
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

type InflightResult = std::result::Result<String, String>;

pub struct ToolExecutor {
    cache: Mutex<LruCache<String, CacheEntry>>,
    inflight: AsyncMutex<HashMap<String, broadcast::Sender<InflightResult>>>,
    cache_enabled: bool,
    cache_ttl: Duration,
}

impl ToolExecutor {
    pub fn new(cache_enabled: bool, cache_ttl_seconds: u64, cache_max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_max_entries.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            inflight: AsyncMutex::new(HashMap::new()),
            cache_enabled: cache_enabled && cache_ttl_seconds > 0 && cache_max_entries > 0,
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
        }
    }

    pub fn cache_key(scope: &str, tool_name: &str, args: &Value) -> String {
        format!("{}|{}|{}", scope, tool_name, normalize_args(args))
    }

    /// Execute `run` under caching and dedupe. `scope` is usually the
    /// session key; an empty scope disables the TTL cache for this call.
    pub async fn execute<F, Fut>(
        &self,
        scope: &str,
        tool_name: &str,
        args: &Value,
        run: F,
    ) -> Result<ExecOutcome, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ToolError>>,
    {
        let key = Self::cache_key(scope, tool_name, args);
        let ttl_cache_on = self.cache_enabled && !scope.trim().is_empty();

        if ttl_cache_on {
            let mut cache = self.cache.lock().unwrap();
            let now = Instant::now();
            let live = cache
                .get(&key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.value.clone());
            if let Some(value) = live {
                debug!(tool = tool_name, "tool cache hit");
                return Ok(ExecOutcome {
                    result: value,
                    cache_hit: true,
                    inflight_deduped: false,
                });
            }
            if cache.peek(&key).is_some() {
                cache.pop(&key);
            }
        }

        // Join an in-flight execution for the same key instead of running
        // the handler twice.
        let primary_tx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(tx) => {
                    let mut rx = tx.subscribe();
                    drop(inflight);
                    debug!(tool = tool_name, "awaiting in-flight execution");
                    return match rx.recv().await {
                        Ok(Ok(value)) => Ok(ExecOutcome {
                            result: value,
                            cache_hit: false,
                            inflight_deduped: true,
                        }),
                        Ok(Err(message)) => Err(ToolError::Handler(message)),
                        Err(_) => Err(ToolError::Handler("in-flight execution dropped".into())),
                    };
                }
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx.clone());
                    tx
                }
            }
        };

        let result = run().await;

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }
        let _ = primary_tx.send(match &result {
            Ok(value) => Ok(value.clone()),
            Err(err) => Err(err.to_string()),
        });

        let value = result?;

        if ttl_cache_on && is_cacheable_tool(tool_name) {
            let mut cache = self.cache.lock().unwrap();
            // Drop expired entries before the LRU cap does its own eviction.
            let now = Instant::now();
            let expired: Vec<String> = cache
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                cache.pop(&k);
            }
            cache.put(
                key,
                CacheEntry {
                    value: value.clone(),
                    expires_at: now + self.cache_ttl,
                },
            );
        }

        Ok(ExecOutcome {
            result: value,
            cache_hit: false,
            inflight_deduped: false,
        })
    }
}

/// Clip a tool result to the configured character budget.
pub fn truncate_result(result: &str, max_chars: usize) -> String {
    if max_chars == 0 || result.chars().count() <= max_chars {
        return result.to_string();
    }
    let head: String = result.chars().take(max_chars).collect();
    format!("{}\n…(截断)", head)
}
