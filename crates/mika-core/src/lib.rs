//! Shared contracts for the Mika conversational core: session/message
//! schema, platform envelope, configuration, error taxonomy, injection
//! guard, and process metrics.

pub mod config;
pub mod envelope;
pub mod error;
pub mod guard;
pub mod jsonx;
pub mod logging;
pub mod media;
pub mod message;
pub mod metrics;
pub mod types;

pub use config::MikaConfig;
pub use envelope::{EventEnvelope, OutboundAction};
pub use error::{ErrorTemplates, MikaError, Result};
pub use message::{ChatMessage, ContentPart, MessageContent, Role, ToolCall};
pub use types::{RequestId, SessionKey};
