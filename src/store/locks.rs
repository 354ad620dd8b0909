//! Per-conversation lock map.
//!
//! The HTTP surface holds a conversation's lock across a whole turn, so two
//! turns for the same conversation never interleave. Locks are created on
//! first use; idle entries are aged out once the map grows past a threshold.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Entries with no holder are evicted once the map exceeds this size.
const EVICT_THRESHOLD: usize = 1024;

/// Map from conversation id to its turn lock.
#[derive(Default)]
pub struct LockMap {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or create) the lock for a conversation.
    pub fn acquire(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock();
        let lock = map
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        if map.len() > EVICT_THRESHOLD {
            // An entry held only by the map has no in-flight turn; a new turn
            // will simply recreate it.
            map.retain(|_, l| Arc::strong_count(l) > 1);
        }
        lock
    }

    /// Number of live entries (test visibility).
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
