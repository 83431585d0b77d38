use crate::source::{FetchError, HistorySource};
use crate::types::{convert_messages, ConversationMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory conversation state keyed by thread id.
///
/// Entries are populated lazily from the history source and live until the
/// orchestrator clears them at the end of a run. The lock is never held
/// across the remote fetch.
pub struct ConversationCache {
    source: Arc<dyn HistorySource>,
    history_limit: usize,
    threads: Mutex<HashMap<String, Vec<ConversationMessage>>>,
}

impl ConversationCache {
    pub fn new(source: Arc<dyn HistorySource>, history_limit: usize) -> Self {
        Self {
            source,
            history_limit,
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Messages for `thread_id`, fetching them when nothing is cached.
    ///
    /// An empty entry counts as absent. If another task populated the entry
    /// while this one was fetching, the existing entry wins.
    pub async fn get(&self, thread_id: &str) -> Result<Vec<ConversationMessage>, FetchError> {
        if let Some(messages) = self.cached(thread_id) {
            return Ok(messages);
        }

        debug!("Cache miss for thread {}", thread_id);
        let fetched = self.source.fetch(thread_id, self.history_limit).await?;
        let converted = convert_messages(fetched);
        info!(
            "Loaded {} messages for thread {}",
            converted.len(),
            thread_id
        );

        let mut threads = self.threads.lock();
        let entry = threads.entry(thread_id.to_string()).or_default();
        if entry.is_empty() {
            *entry = converted;
        }
        Ok(entry.clone())
    }

    /// Append one message to the end of the thread.
    pub fn append(&self, thread_id: &str, message: ConversationMessage) {
        self.threads
            .lock()
            .entry(thread_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn clear(&self, thread_id: &str) {
        if self.threads.lock().remove(thread_id).is_some() {
            debug!("Cleared cached messages for thread {}", thread_id);
        }
    }

    /// Cached messages without touching the source.
    pub fn cached(&self, thread_id: &str) -> Option<Vec<ConversationMessage>> {
        self.threads
            .lock()
            .get(thread_id)
            .filter(|messages| !messages.is_empty())
            .cloned()
    }

    pub fn contains(&self, thread_id: &str) -> bool {
        self.threads.lock().contains_key(thread_id)
    }
}
