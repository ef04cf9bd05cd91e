//! Opaque backend seams for long-term memory, knowledge, and profiles.
//!
//! Vector indexing lives outside the core; these traits are the whole
//! contract. In-memory reference implementations back the tests.

use async_trait::async_trait;

use mika_core::types::SessionKey;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFact {
    pub user_id: String,
    pub fact: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSnippet {
    pub title: String,
    pub snippet: String,
    pub score: f64,
}

/// Long-term memory over embedded facts. Deduplication is the backend's
/// concern (near-identical embeddings collapse).
#[async_trait]
pub trait VectorMemoryStore: Send + Sync {
    async fn add_fact(
        &self,
        session_key: &SessionKey,
        user_id: &str,
        fact: &str,
        source: &str,
    ) -> Result<()>;

    async fn search(
        &self,
        session_key: &SessionKey,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredFact>>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn search(&self, query: &str, top_k: usize, corpus_id: &str) -> Result<Vec<ScoredSnippet>>;
}

#[async_trait]
pub trait UserProfileStore: Send + Sync {
    /// Short rendered profile for prompt injection; None when unknown.
    async fn profile_summary(&self, user_id: &str) -> Result<Option<String>>;
}

/// Token-overlap reference store. Good enough to exercise retrieval paths
/// deterministically; production backends replace it wholesale.
pub mod reference {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn overlap_score(query: &str, candidate: &str) -> f64 {
        let q = tokens(query);
        let c = tokens(candidate);
        if q.is_empty() || c.is_empty() {
            // CJK text tokenizes poorly; fall back to substring containment.
            return if !query.trim().is_empty() && candidate.contains(query.trim()) {
                0.9
            } else {
                0.0
            };
        }
        let hits = q.iter().filter(|t| c.contains(t)).count();
        hits as f64 / q.len() as f64
    }

    #[derive(Default)]
    pub struct InMemoryVectorStore {
        facts: Mutex<HashMap<String, Vec<(String, String)>>>,
    }

    impl InMemoryVectorStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl VectorMemoryStore for InMemoryVectorStore {
        async fn add_fact(
            &self,
            session_key: &SessionKey,
            user_id: &str,
            fact: &str,
            _source: &str,
        ) -> Result<()> {
            let mut facts = self.facts.lock().unwrap();
            let entry = facts.entry(session_key.as_str().to_string()).or_default();
            if !entry.iter().any(|(_, existing)| existing == fact) {
                entry.push((user_id.to_string(), fact.to_string()));
            }
            Ok(())
        }

        async fn search(
            &self,
            session_key: &SessionKey,
            query: &str,
            top_k: usize,
        ) -> Result<Vec<ScoredFact>> {
            let facts = self.facts.lock().unwrap();
            let mut scored: Vec<ScoredFact> = facts
                .get(session_key.as_str())
                .map(|entries| {
                    entries
                        .iter()
                        .map(|(user_id, fact)| ScoredFact {
                            user_id: user_id.clone(),
                            fact: fact.clone(),
                            score: overlap_score(query, fact),
                        })
                        .filter(|f| f.score > 0.0)
                        .collect()
                })
                .unwrap_or_default();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k.max(1));
            Ok(scored)
        }
    }

    #[derive(Default)]
    pub struct InMemoryKnowledgeStore {
        entries: Mutex<Vec<(String, String, String)>>,
    }

    impl InMemoryKnowledgeStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, corpus_id: &str, title: &str, snippet: &str) {
            self.entries.lock().unwrap().push((
                corpus_id.to_string(),
                title.to_string(),
                snippet.to_string(),
            ));
        }
    }

    #[async_trait]
    impl KnowledgeStore for InMemoryKnowledgeStore {
        async fn search(
            &self,
            query: &str,
            top_k: usize,
            corpus_id: &str,
        ) -> Result<Vec<ScoredSnippet>> {
            let entries = self.entries.lock().unwrap();
            let mut scored: Vec<ScoredSnippet> = entries
                .iter()
                .filter(|(corpus, _, _)| corpus_id.is_empty() || corpus == corpus_id)
                .map(|(_, title, snippet)| ScoredSnippet {
                    title: title.clone(),
                    snippet: snippet.clone(),
                    score: overlap_score(query, snippet).max(overlap_score(query, title)),
                })
                .filter(|s| s.score > 0.0)
                .collect();
            scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k.max(1));
            Ok(scored)
        }
    }

    #[derive(Default)]
    pub struct InMemoryProfileStore {
        profiles: Mutex<HashMap<String, String>>,
    }

    impl InMemoryProfileStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, user_id: &str, summary: &str) {
            self.profiles
                .lock()
                .unwrap()
                .insert(user_id.to_string(), summary.to_string());
        }
    }

    #[async_trait]
    impl UserProfileStore for InMemoryProfileStore {
        async fn profile_summary(&self, user_id: &str) -> Result<Option<String>> {
            Ok(self.profiles.lock().unwrap().get(user_id).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::reference::*;
    use super::*;

    #[tokio::test]
    async fn vector_store_ranks_by_overlap_and_dedupes() {
        let store = InMemoryVectorStore::new();
        let key = SessionKey::for_group("g");
        store.add_fact(&key, "1", "likes rust programming", "extract").await.unwrap();
        store.add_fact(&key, "1", "likes rust programming", "extract").await.unwrap();
        store.add_fact(&key, "2", "owns a cat", "extract").await.unwrap();

        let hits = store.search(&key, "rust programming", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, "1");
        assert!(hits[0].score > 0.5);
    }

    #[tokio::test]
    async fn knowledge_store_filters_by_corpus() {
        let store = InMemoryKnowledgeStore::new();
        store.insert("docs", "Install", "how to install the bot");
        store.insert("faq", "Install", "installation steps faq");
        let hits = store.search("install", 5, "docs").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Install");
    }
}
