//! Dream runs: offline per-session topic deduplication and cleanup.
//!
//! Triggered when a session has been idle long enough. Groups topics by
//! normalized name, merges duplicates into the newest row, prunes
//! low-signal topics, all within an iteration budget. A per-session lock
//! keeps concurrent dream runs apart.

use std::sync::Arc;

use dashmap::DashSet;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use mika_core::types::SessionKey;

use crate::topic::{TopicStore, TopicSummaryEntry, TopicUpsert};

const MAX_KEYWORDS: usize = 8;
const MAX_KEY_POINTS: usize = 6;
const MAX_PARTICIPANTS: usize = 8;
const SEARCH_LIMIT: usize = 64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DreamStats {
    pub merged: usize,
    pub deleted: usize,
    pub updated: usize,
}

fn normalize_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\p{P}\p{S}_]+").unwrap())
}

/// Case-folded, punctuation/whitespace-free topic identity.
pub fn normalize_topic_name(value: &str) -> String {
    normalize_re()
        .replace_all(value.trim().to_lowercase().as_str(), "")
        .into_owned()
}

fn merge_unique(groups: &[&[String]], limit: usize) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for group in groups {
        for item in group.iter() {
            let text = item.trim();
            if text.is_empty() {
                continue;
            }
            let key = text.to_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            result.push(text.to_string());
            if result.len() >= limit {
                return result;
            }
        }
    }
    result
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

pub struct DreamAgent {
    store: Arc<TopicStore>,
    max_iterations: u32,
    min_summary_chars: usize,
    max_merged_summary_chars: usize,
    /// Sessions with a dream run currently in flight.
    locks: DashSet<String>,
}

impl DreamAgent {
    pub fn new(
        store: Arc<TopicStore>,
        max_iterations: u32,
        min_summary_chars: usize,
        max_merged_summary_chars: usize,
    ) -> Self {
        Self {
            store,
            max_iterations: max_iterations.max(1),
            min_summary_chars: min_summary_chars.max(4),
            max_merged_summary_chars: max_merged_summary_chars.max(64),
            locks: DashSet::new(),
        }
    }

    /// Idle gate: enough minutes since the session's last archived message.
    pub fn is_idle(last_activity_epoch: Option<f64>, idle_minutes: u64, now_epoch: f64) -> bool {
        match last_activity_epoch {
            Some(ts) if ts > 0.0 => now_epoch - ts >= idle_minutes as f64 * 60.0,
            _ => false,
        }
    }

    /// One dream run. Returns None when another run holds the session lock.
    pub fn run_session(&self, session_key: &SessionKey) -> Option<DreamStats> {
        if !self.locks.insert(session_key.as_str().to_string()) {
            debug!(session_key = %session_key, "dream run already in flight, skipped");
            return None;
        }
        let stats = self.run_locked(session_key);
        self.locks.remove(session_key.as_str());
        Some(stats)
    }

    fn run_locked(&self, session_key: &SessionKey) -> DreamStats {
        let mut stats = DreamStats::default();
        let topics = match self.store.list_topics(session_key, SEARCH_LIMIT) {
            Ok(t) => t,
            Err(err) => {
                warn!(%err, "dream topic listing failed");
                return stats;
            }
        };
        if topics.len() <= 1 {
            return stats;
        }

        let mut budget = self.max_iterations as usize;

        // Group by normalized name; only groups with duplicates merge.
        let mut groups: Vec<(String, Vec<&TopicSummaryEntry>)> = Vec::new();
        for topic in &topics {
            let key = normalize_topic_name(&topic.topic);
            if key.is_empty() {
                continue;
            }
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(topic),
                None => groups.push((key, vec![topic])),
            }
        }

        for (_, mut group) in groups {
            if budget == 0 {
                break;
            }
            if group.len() <= 1 {
                continue;
            }
            group.sort_by(|a, b| {
                b.updated_at
                    .partial_cmp(&a.updated_at)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let primary = group[0];
            let duplicates = &group[1..];

            let mut summary_parts = vec![primary.summary.trim().to_string()];
            let mut keywords_groups: Vec<&[String]> = vec![&primary.keywords];
            let mut points_groups: Vec<&[String]> = vec![&primary.key_points];
            let mut participants_groups: Vec<&[String]> = vec![&primary.participants];
            let mut timestamp_start = primary.timestamp_start;
            let mut timestamp_end = primary.timestamp_end;
            let mut source_count = primary.source_message_count;

            let mut absorbed: Vec<&TopicSummaryEntry> = Vec::new();
            for extra in duplicates {
                if budget == 0 {
                    break;
                }
                budget -= 1;
                let extra_summary = extra.summary.trim();
                if !extra_summary.is_empty() {
                    summary_parts.push(extra_summary.to_string());
                }
                keywords_groups.push(&extra.keywords);
                points_groups.push(&extra.key_points);
                participants_groups.push(&extra.participants);
                if extra.timestamp_start > 0.0 {
                    timestamp_start = if timestamp_start > 0.0 {
                        timestamp_start.min(extra.timestamp_start)
                    } else {
                        extra.timestamp_start
                    };
                }
                timestamp_end = timestamp_end.max(extra.timestamp_end);
                source_count += extra.source_message_count;
                absorbed.push(extra);
            }
            if absorbed.is_empty() {
                continue;
            }

            let merged_entry = TopicUpsert {
                topic: primary.topic.clone(),
                summary: truncate_chars(
                    &summary_parts
                        .iter()
                        .filter(|s| !s.is_empty())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(" / "),
                    self.max_merged_summary_chars,
                ),
                keywords: merge_unique(&keywords_groups, MAX_KEYWORDS),
                key_points: merge_unique(&points_groups, MAX_KEY_POINTS),
                participants: merge_unique(&participants_groups, MAX_PARTICIPANTS),
                timestamp_start,
                timestamp_end,
                source_message_count: source_count,
            };

            if let Err(err) = self.store.replace(session_key, &merged_entry) {
                warn!(%err, "dream merge update failed");
                continue;
            }
            stats.updated += 1;
            for extra in absorbed {
                match self.store.delete_topic(session_key, &extra.topic) {
                    Ok(true) => {
                        stats.merged += 1;
                        stats.deleted += 1;
                    }
                    Ok(false) => {}
                    Err(err) => warn!(%err, "dream duplicate delete failed"),
                }
            }
        }

        // Prune topics that never grew past a single thin summary.
        if let Ok(remaining) = self.store.list_topics(session_key, SEARCH_LIMIT) {
            for topic in remaining {
                if budget == 0 {
                    break;
                }
                if topic.summary.chars().count() < self.min_summary_chars
                    && topic.source_message_count <= 1
                {
                    budget -= 1;
                    if self
                        .store
                        .delete_topic(session_key, &topic.topic)
                        .unwrap_or(false)
                    {
                        stats.deleted += 1;
                    }
                }
            }
        }

        if stats != DreamStats::default() {
            info!(
                session_key = %session_key,
                merged = stats.merged,
                deleted = stats.deleted,
                updated = stats.updated,
                "dream run complete"
            );
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> (Arc<TopicStore>, DreamAgent) {
        let store = Arc::new(TopicStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let agent = DreamAgent::new(store.clone(), 20, 8, 200);
        (store, agent)
    }

    fn upsert(store: &TopicStore, key: &SessionKey, topic: &str, summary: &str, count: u32) {
        store
            .upsert(
                key,
                &TopicUpsert {
                    topic: topic.to_string(),
                    summary: summary.to_string(),
                    keywords: vec![topic.to_string()],
                    key_points: vec![format!("point about {}", topic)],
                    participants: vec!["1".into()],
                    timestamp_start: 10.0,
                    timestamp_end: 20.0,
                    source_message_count: count,
                },
            )
            .unwrap();
    }

    #[test]
    fn normalized_names_collapse_punctuation_and_case() {
        assert_eq!(normalize_topic_name("Rust 编程!"), normalize_topic_name("rust编程"));
        assert_ne!(normalize_topic_name("旅行"), normalize_topic_name("美食"));
    }

    #[test]
    fn duplicates_merge_into_newest_primary() {
        let (store, agent) = setup();
        let key = SessionKey::for_group("g");
        upsert(&store, &key, "Rust 编程", "聊了 rust 的所有权模型，讨论比较深入", 4);
        upsert(&store, &key, "rust编程", "继续讨论借用检查器和生命周期问题", 3);

        let stats = agent.run_session(&key).unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.deleted, 1);
        let topics = store.list_topics(&key, 10).unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].source_message_count, 7);
        assert!(topics[0].summary.contains(" / "));
    }

    #[test]
    fn thin_single_source_topics_are_pruned() {
        let (store, agent) = setup();
        let key = SessionKey::for_group("g");
        upsert(&store, &key, "闲聊", "嗯", 1);
        upsert(&store, &key, "旅行", "计划十月去北海道，讨论了机票和住宿的预算", 5);

        let stats = agent.run_session(&key).unwrap();
        assert_eq!(stats.deleted, 1);
        let topics = store.list_topics(&key, 10).unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].topic, "旅行");
    }

    #[test]
    fn session_lock_blocks_concurrent_runs() {
        let (store, agent) = setup();
        let key = SessionKey::for_group("g");
        upsert(&store, &key, "a", "x", 1);
        agent.locks.insert(key.as_str().to_string());
        assert!(agent.run_session(&key).is_none());
    }

    #[test]
    fn idle_gate_requires_elapsed_minutes() {
        assert!(DreamAgent::is_idle(Some(1000.0), 30, 1000.0 + 1801.0));
        assert!(!DreamAgent::is_idle(Some(1000.0), 30, 1000.0 + 600.0));
        assert!(!DreamAgent::is_idle(None, 30, 5000.0));
    }
}
