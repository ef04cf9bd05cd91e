use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("invalid tool definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("tool failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, ToolError>;
