//! HTTP request handlers.

/// Chat ingress and turn cancellation.
pub mod chat;
/// Conversation reads.
pub mod conversations;
/// Workspace file listing and range streaming.
pub mod files;
