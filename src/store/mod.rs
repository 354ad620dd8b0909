//! Durable conversation storage.
//!
//! Conversations are stored one JSON file per conversation under a per-user
//! directory, with a flat index for lookup and per-user idempotency maps.
//! All mutating operations on a conversation are serialized by the
//! per-conversation lock map; reads go straight to disk without the lock.

mod conversation;
mod idempotency;
mod locks;
pub mod workdir;

pub use conversation::{
    AppendUserOutcome, Conversation, ConversationStore, ConversationSummary,
};
pub use locks::LockMap;
