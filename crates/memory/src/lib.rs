//! Per-thread conversation cache backed by a remote history source.

pub mod cache;
pub mod source;
pub mod types;

pub use cache::ConversationCache;
pub use source::{FetchError, HistorySource, HttpHistorySource};
pub use types::*;
