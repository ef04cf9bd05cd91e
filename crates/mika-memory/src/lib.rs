//! Long-term memory: fact extraction, topic summaries, dream cleanup, and
//! the ReAct retrieval agent over four knowledge sources.

pub mod dream;
pub mod error;
pub mod extractor;
pub mod retrieval;
pub mod stores;
pub mod summarizer;
pub mod topic;

pub use dream::{DreamAgent, DreamStats};
pub use error::{MemoryError, Result};
pub use extractor::MemoryExtractor;
pub use retrieval::RetrievalAgent;
pub use stores::{KnowledgeStore, ScoredFact, ScoredSnippet, UserProfileStore, VectorMemoryStore};
pub use summarizer::TopicSummarizer;
pub use topic::{TopicStore, TopicSummaryEntry, TopicUpsert};
