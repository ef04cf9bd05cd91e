//! Lifecycle hooks and the persistent per-request trace store.

pub mod hooks;
pub mod trace;

pub use hooks::{emit, AgentHooks, HookEvent, NoopHooks};
pub use trace::{TraceHooks, TraceRow, TraceStore, TraceSummary};
