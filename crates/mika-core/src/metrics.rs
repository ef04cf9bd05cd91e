//! Process-local counters for the chat pipeline.
//!
//! Plain atomics, no exporter: the numbers feed trace events and logs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub api_empty_reply_total: AtomicU64,
    pub tool_blocked_total: AtomicU64,
    pub tool_cache_hits: AtomicU64,
    pub proactive_trigger_total: AtomicU64,
    pub proactive_reject_total: AtomicU64,
    pub presearch_hit_total: AtomicU64,
    pub presearch_skip_total: AtomicU64,
    /// Breakdown of why replies came back empty (provider_empty, ...).
    empty_reply_reasons: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_reply_reason(&self, reason: &str) {
        self.api_empty_reply_total.fetch_add(1, Ordering::Relaxed);
        let mut reasons = self.empty_reply_reasons.lock().unwrap();
        *reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn empty_reply_reasons(&self) -> BTreeMap<String, u64> {
        self.empty_reply_reasons.lock().unwrap().clone()
    }

    /// Flat snapshot for logs / trace events.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        out.insert("requests_total".into(), self.requests_total.load(Ordering::Relaxed));
        out.insert(
            "api_empty_reply_total".into(),
            self.api_empty_reply_total.load(Ordering::Relaxed),
        );
        out.insert("tool_blocked_total".into(), self.tool_blocked_total.load(Ordering::Relaxed));
        out.insert("tool_cache_hits".into(), self.tool_cache_hits.load(Ordering::Relaxed));
        out.insert(
            "proactive_trigger_total".into(),
            self.proactive_trigger_total.load(Ordering::Relaxed),
        );
        out.insert(
            "proactive_reject_total".into(),
            self.proactive_reject_total.load(Ordering::Relaxed),
        );
        out.insert("presearch_hit_total".into(), self.presearch_hit_total.load(Ordering::Relaxed));
        out.insert("presearch_skip_total".into(), self.presearch_skip_total.load(Ordering::Relaxed));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_accumulate_alongside_total() {
        let metrics = Metrics::new();
        metrics.record_empty_reply_reason("provider_empty");
        metrics.record_empty_reply_reason("provider_empty");
        metrics.record_empty_reply_reason("reasoning_only_empty");
        assert_eq!(metrics.api_empty_reply_total.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.empty_reply_reasons()["provider_empty"], 2);
    }
}
