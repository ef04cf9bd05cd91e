//! Built-in tools exposed to the model.

pub mod group_history;
pub mod history_images;
pub mod knowledge;
pub mod web_search;

pub use group_history::SearchGroupHistoryTool;
pub use history_images::{FetchHistoryImagesTool, HistoryImageBackend, HistoryImages};
pub use knowledge::SearchKnowledgeTool;
pub use web_search::{SearchBackend, WebSearchTool};
