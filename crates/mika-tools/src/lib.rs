//! Tool registry, executor, and the bounded tool-calling loop.

pub mod builtin;
pub mod error;
pub mod executor;
pub mod refine;
pub mod registry;
pub mod schema;
pub mod tool_loop;

pub use error::ToolError;
pub use executor::{is_cacheable_tool, normalize_args, truncate_result, ExecOutcome, ToolExecutor};
pub use refine::{BlockReason, SearchState};
pub use registry::{RegisteredTool, Tool, ToolContext, ToolRegistry, ToolSource};
pub use schema::{build_tool_specs, SchemaFallback, SchemaMode};
pub use tool_loop::{ToolLoop, ToolLoopConfig, ToolLoopOutcome};
