//! Provider abstraction and transport: one internal OpenAI-style request
//! shape, three wire formats (OpenAI-compatible, Anthropic, Google GenAI),
//! key rotation, and empty-reply recovery.

pub mod adapter;
pub mod anthropic;
pub mod capabilities;
pub mod google;
pub mod keypool;
pub mod model;
pub mod openai;
pub mod stream;
pub mod transport;

pub use adapter::{build_provider_request, parse_provider_response};
pub use capabilities::{get_provider_capabilities, ProviderCapabilities};
pub use keypool::KeyPool;
pub use model::{
    CompletionReply, CompletionRequest, EmptyReplyKind, EmptyReplyMeta, ProviderKind, ToolSpec,
    Usage,
};
pub use transport::{CompletionClient, Transport};
