//! File-backed conversation store.
//!
//! One JSON record per conversation at
//! `data/conversations/<user>/<YYYY-MM>/<timestamp>_<conv_id>.json`, indexed
//! by `data/index.json` (rebuilt by scanning if absent). User-message inserts
//! are idempotent on `(user, client_msg_id)`; assistant messages follow the
//! placeholder-then-finalize pattern, with in-turn messages inserted ahead of
//! the trailing placeholder so the persisted order matches the turn's state
//! machine.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::idempotency::IdempotencyIndex;
use super::locks::LockMap;
use super::workdir;
use crate::types::{
    merge_generated_files, AppError, FileEntry, Message, MessageRole, MessageStatus, Result,
    ToolCall,
};

/// A full conversation record as persisted on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation identifier.
    pub conversation_id: String,
    /// Owning user.
    pub user: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Ordered message log.
    pub messages: Vec<Message>,
}

/// Conversation summary returned in list endpoints.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConversationSummary {
    /// Unique conversation identifier.
    pub conversation_id: String,
    /// Number of messages in the conversation.
    pub message_count: usize,
    /// RFC3339 formatted creation timestamp.
    pub created_at: String,
    /// RFC3339 formatted last update timestamp.
    pub updated_at: String,
}

/// Result of an idempotent user-message append.
#[derive(Debug, Clone)]
pub struct AppendUserOutcome {
    /// Server id of the inserted (or previously inserted) user message.
    pub server_msg_id: String,
    /// True when `(user, client_msg_id)` had already been recorded.
    pub deduplicated: bool,
    /// Status of the assistant message that answers this user message, for
    /// replayed requests. `InProgress` while the original turn is running.
    pub turn_status: MessageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    path: PathBuf,
    user: String,
}

/// Durable conversation storage rooted at the configured data directory.
pub struct ConversationStore {
    conversations_dir: PathBuf,
    index_path: PathBuf,
    outputs_dir: PathBuf,
    index: RwLock<HashMap<String, IndexEntry>>,
    idempotency: IdempotencyIndex,
    locks: LockMap,
}

impl ConversationStore {
    /// Open (or initialize) a store.
    pub fn new(data_dir: impl Into<PathBuf>, outputs_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        let outputs_dir = outputs_dir.into();
        let conversations_dir = data_dir.join("conversations");
        let index_path = data_dir.join("index.json");

        std::fs::create_dir_all(&conversations_dir)
            .map_err(|e| AppError::Store(format!("Failed to create data dir: {}", e)))?;
        std::fs::create_dir_all(&outputs_dir)
            .map_err(|e| AppError::Store(format!("Failed to create outputs dir: {}", e)))?;

        let store = Self {
            conversations_dir,
            index_path,
            outputs_dir,
            index: RwLock::new(HashMap::new()),
            idempotency: IdempotencyIndex::new(data_dir.join("idempotency")),
            locks: LockMap::new(),
        };
        store.load_or_rebuild_index()?;
        Ok(store)
    }

    /// The turn lock for a conversation. Held by the HTTP surface across a
    /// whole turn; read paths do not take it.
    pub fn turn_lock(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.acquire(conversation_id)
    }

    // ============= Index =============

    fn load_or_rebuild_index(&self) -> Result<()> {
        if let Ok(raw) = std::fs::read_to_string(&self.index_path) {
            if let Ok(map) = serde_json::from_str::<HashMap<String, IndexEntry>>(&raw) {
                *self.index.write() = map;
                return Ok(());
            }
            warn!("index.json is unreadable, rebuilding from disk");
        }
        let mut map = HashMap::new();
        for entry in walkdir::WalkDir::new(&self.conversations_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            match std::fs::read_to_string(entry.path())
                .ok()
                .and_then(|raw| serde_json::from_str::<Conversation>(&raw).ok())
            {
                Some(conv) => {
                    map.insert(
                        conv.conversation_id.clone(),
                        IndexEntry {
                            path: entry.path().to_path_buf(),
                            user: conv.user,
                        },
                    );
                }
                None => warn!(path = %entry.path().display(), "Skipping unreadable conversation file"),
            }
        }
        info!(conversations = map.len(), "Rebuilt conversation index");
        *self.index.write() = map;
        self.persist_index()
    }

    fn persist_index(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&*self.index.read())
            .map_err(|e| AppError::Store(format!("Failed to serialize index: {}", e)))?;
        write_atomic(&self.index_path, raw.as_bytes())
    }

    // ============= Record I/O =============

    fn load(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let entry = match self.index.read().get(conversation_id) {
            Some(e) => e.clone(),
            None => return Ok(None),
        };
        let raw = std::fs::read_to_string(&entry.path)
            .map_err(|e| AppError::Store(format!("Failed to read {}: {}", entry.path.display(), e)))?;
        let conv = serde_json::from_str(&raw)
            .map_err(|e| AppError::Store(format!("Corrupt conversation record: {}", e)))?;
        Ok(Some(conv))
    }

    fn load_required(&self, conversation_id: &str) -> Result<Conversation> {
        self.load(conversation_id)?.ok_or_else(|| {
            AppError::NotFound(format!("Conversation not found: {}", conversation_id))
        })
    }

    fn load_or_create(&self, conversation_id: &str, user: &str) -> Result<Conversation> {
        if let Some(conv) = self.load(conversation_id)? {
            return Ok(conv);
        }
        let now = Utc::now();
        let conv = Conversation {
            conversation_id: conversation_id.to_string(),
            user: user.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };
        let path = self
            .conversations_dir
            .join(sanitize(user))
            .join(now.format("%Y-%m").to_string())
            .join(format!(
                "{}_{}.json",
                now.format("%Y%m%d%H%M%S"),
                sanitize(conversation_id)
            ));
        self.index.write().insert(
            conversation_id.to_string(),
            IndexEntry {
                path,
                user: user.to_string(),
            },
        );
        self.save(&conv)?;
        self.persist_index()?;
        Ok(conv)
    }

    fn save(&self, conv: &Conversation) -> Result<()> {
        let entry = self
            .index
            .read()
            .get(&conv.conversation_id)
            .cloned()
            .ok_or_else(|| {
                AppError::Store(format!("Conversation missing from index: {}", conv.conversation_id))
            })?;
        let raw = serde_json::to_string_pretty(conv)
            .map_err(|e| AppError::Store(format!("Failed to serialize conversation: {}", e)))?;
        write_atomic(&entry.path, raw.as_bytes())
    }

    // ============= Mutations =============

    /// Read-only idempotency probe for `(user, client_msg_id)`. Safe to call
    /// without the turn lock; a replayed request answers from this without
    /// queuing behind the in-flight turn.
    pub fn idempotency_lookup(
        &self,
        conversation_id: &str,
        user: &str,
        client_msg_id: &str,
    ) -> Result<Option<AppendUserOutcome>> {
        let Some(prior) = self.idempotency.get(user, client_msg_id) else {
            return Ok(None);
        };
        let turn_status = self
            .load(conversation_id)?
            .and_then(|conv| turn_status_for(&conv.messages, &prior))
            .unwrap_or(MessageStatus::Completed);
        Ok(Some(AppendUserOutcome {
            server_msg_id: prior,
            deduplicated: true,
            turn_status,
        }))
    }

    /// Idempotently append a user message. If `(user, client_msg_id)` is
    /// already recorded, the prior `server_msg_id` is returned and storage is
    /// untouched. Callers hold the conversation's turn lock.
    pub fn append_user_message(
        &self,
        conversation_id: &str,
        user: &str,
        content: &str,
        client_msg_id: &str,
    ) -> Result<AppendUserOutcome> {
        if let Some(hit) = self.idempotency_lookup(conversation_id, user, client_msg_id)? {
            return Ok(hit);
        }

        let mut conv = self.load_or_create(conversation_id, user)?;
        let message = Message::user(content, client_msg_id);
        let server_msg_id = message.server_msg_id.clone();
        conv.messages.push(message);
        conv.updated_at = Utc::now();
        // Write-then-commit: the record rename is the commit point, the
        // idempotency entry follows it so a replay can never reference a
        // message that was not durably inserted.
        self.save(&conv)?;
        self.idempotency.record(user, client_msg_id, &server_msg_id)?;

        Ok(AppendUserOutcome {
            server_msg_id,
            deduplicated: false,
            turn_status: MessageStatus::InProgress,
        })
    }

    /// Insert an in-progress assistant placeholder.
    pub fn create_assistant_placeholder(
        &self,
        conversation_id: &str,
        user: &str,
    ) -> Result<String> {
        let mut conv = self.load_or_create(conversation_id, user)?;
        let message = Message::assistant_placeholder();
        let server_msg_id = message.server_msg_id.clone();
        conv.messages.push(message);
        conv.updated_at = Utc::now();
        self.save(&conv)?;
        Ok(server_msg_id)
    }

    /// Finalize (or fail) the placeholder row. Rejects the update when the
    /// row is no longer `in_progress`, which protects against racing
    /// finalizers.
    pub fn update_assistant(
        &self,
        conversation_id: &str,
        server_msg_id: &str,
        content: &str,
        tool_calls: Vec<ToolCall>,
        generated_files: Vec<String>,
        status: MessageStatus,
    ) -> Result<()> {
        let mut conv = self.load_required(conversation_id)?;
        let message = conv
            .messages
            .iter_mut()
            .find(|m| m.server_msg_id == server_msg_id)
            .ok_or_else(|| AppError::NotFound(format!("Message not found: {}", server_msg_id)))?;
        if message.status != MessageStatus::InProgress {
            return Err(AppError::Store(format!(
                "Message {} is not in progress",
                server_msg_id
            )));
        }
        message.content = content.to_string();
        message.tool_calls = tool_calls;
        merge_generated_files(&mut message.generated_files, &generated_files);
        message.status = status;
        conv.updated_at = Utc::now();
        self.save(&conv)
    }

    /// Append a completed assistant message carrying tool calls, placed
    /// ahead of the trailing placeholder so the log keeps state-machine
    /// order. The `role=tool` observations that follow reference these call
    /// ids.
    pub fn append_assistant_tool_calls(
        &self,
        conversation_id: &str,
        content: &str,
        tool_calls: Vec<ToolCall>,
    ) -> Result<String> {
        let mut conv = self.load_required(conversation_id)?;
        let mut message = Message::assistant_placeholder();
        message.content = content.to_string();
        message.tool_calls = tool_calls;
        message.status = MessageStatus::Completed;
        let server_msg_id = message.server_msg_id.clone();
        insert_before_placeholder(&mut conv.messages, message);
        conv.updated_at = Utc::now();
        self.save(&conv)?;
        Ok(server_msg_id)
    }

    /// Append a `role=tool` observation message.
    pub fn append_tool_message(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        name: &str,
        content: &str,
        generated_files: Vec<String>,
    ) -> Result<String> {
        let mut conv = self.load_required(conversation_id)?;
        let message = Message::tool(tool_call_id, name, content, generated_files);
        let server_msg_id = message.server_msg_id.clone();
        insert_before_placeholder(&mut conv.messages, message);
        conv.updated_at = Utc::now();
        self.save(&conv)?;
        Ok(server_msg_id)
    }

    /// Merge the trailing pair of same-role messages whose contents are
    /// whitespace-equivalent: their `generated_files` become an
    /// order-preserving deduplicated union on the surviving (later) message
    /// and the earlier one is dropped. Recovery hook for retried turns the
    /// idempotency key did not catch.
    pub fn neighbor_normalize(&self, conversation_id: &str) -> Result<()> {
        let mut conv = self.load_required(conversation_id)?;
        let n = conv.messages.len();
        if n < 2 {
            return Ok(());
        }
        let (earlier, later) = (&conv.messages[n - 2], &conv.messages[n - 1]);
        if earlier.role != later.role
            || collapse_whitespace(&earlier.content) != collapse_whitespace(&later.content)
        {
            return Ok(());
        }
        let mut merged = earlier.generated_files.clone();
        merge_generated_files(&mut merged, &later.generated_files);
        conv.messages[n - 1].generated_files = merged;
        conv.messages.remove(n - 2);
        conv.updated_at = Utc::now();
        self.save(&conv)
    }

    // ============= Reads =============

    /// Full conversation record.
    pub fn get(&self, conversation_id: &str) -> Result<Conversation> {
        self.load_required(conversation_id)
    }

    /// Whether the conversation exists.
    pub fn exists(&self, conversation_id: &str) -> bool {
        self.index.read().contains_key(conversation_id)
    }

    /// Summaries of a user's conversations, most recently updated first.
    pub fn list_for_user(&self, user: &str) -> Result<Vec<ConversationSummary>> {
        let ids: Vec<String> = self
            .index
            .read()
            .iter()
            .filter(|(_, e)| e.user == user)
            .map(|(id, _)| id.clone())
            .collect();
        let mut summaries = Vec::new();
        for id in ids {
            if let Some(conv) = self.load(&id)? {
                summaries.push(ConversationSummary {
                    conversation_id: conv.conversation_id,
                    message_count: conv.messages.len(),
                    created_at: conv.created_at.to_rfc3339(),
                    updated_at: conv.updated_at.to_rfc3339(),
                });
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    // ============= Working directory =============

    /// The conversation's working directory, created on first access.
    pub fn workdir(&self, conversation_id: &str) -> Result<PathBuf> {
        let dir = self.outputs_dir.join(sanitize(conversation_id));
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::Store(format!("Failed to create workdir: {}", e)))?;
        Ok(dir)
    }

    /// List files currently present in the working directory.
    pub fn list_files(&self, conversation_id: &str) -> Result<Vec<FileEntry>> {
        let dir = self.outputs_dir.join(sanitize(conversation_id));
        workdir::list_entries(&dir)
    }
}

/// Insert ahead of a trailing in-progress assistant placeholder, so the
/// finalized placeholder always lands after the turn's tool traffic.
fn insert_before_placeholder(messages: &mut Vec<Message>, message: Message) {
    let insert_at = match messages.last() {
        Some(last)
            if last.role == MessageRole::Assistant && last.status == MessageStatus::InProgress =>
        {
            messages.len() - 1
        }
        _ => messages.len(),
    };
    messages.insert(insert_at, message);
}

/// Status of the assistant message answering the given user message.
fn turn_status_for(messages: &[Message], user_server_msg_id: &str) -> Option<MessageStatus> {
    let idx = messages
        .iter()
        .position(|m| m.server_msg_id == user_server_msg_id)?;
    messages[idx + 1..]
        .iter()
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| m.status)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| AppError::Store(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)
        .map_err(|e| AppError::Store(format!("Failed to write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| AppError::Store(format!("Failed to commit {}: {}", path.display(), e)))?;
    Ok(())
}

/// Keep user- and conversation-derived path segments on a safe alphabet.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
