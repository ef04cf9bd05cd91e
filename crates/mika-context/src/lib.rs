//! Context storage and working-set construction: snapshot + archive store,
//! per-request trimming, group transcript synthesis, and request budgets.

pub mod budget;
pub mod error;
pub mod manager;
pub mod store;
pub mod transcript;

pub use budget::{enforce_budgets, resolve_soft_tokens, BudgetOutcome};
pub use error::{ContextError, Result};
pub use manager::{ContextManager, ContextMode};
pub use store::{ArchivedMessage, ContextStore};
pub use transcript::{
    build_participants_line, build_transcript_block, build_transcript_lines,
    shrink_transcript_block, TranscriptResult, TRANSCRIPT_FOOTER, TRANSCRIPT_HEADER,
};
