//! Per-user idempotency maps.
//!
//! Each user has an append-only `(client_msg_id -> server_msg_id)` map,
//! cached in memory and persisted to `data/idempotency/<user>.json`. The
//! caller is responsible for ordering: the map is written after the
//! conversation insert has committed, under the same per-conversation lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::{AppError, Result};

pub struct IdempotencyIndex {
    dir: PathBuf,
    cache: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl IdempotencyIndex {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn user_path(&self, user: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(user)))
    }

    fn load_user(&self, user: &str) -> HashMap<String, String> {
        let path = self.user_path(user);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Look up a prior `server_msg_id` for `(user, client_msg_id)`.
    pub fn get(&self, user: &str, client_msg_id: &str) -> Option<String> {
        let mut cache = self.cache.lock();
        let map = cache
            .entry(user.to_string())
            .or_insert_with(|| self.load_user(user));
        map.get(client_msg_id).cloned()
    }

    /// Record an entry and persist the user's map.
    pub fn record(&self, user: &str, client_msg_id: &str, server_msg_id: &str) -> Result<()> {
        let mut cache = self.cache.lock();
        let map = cache
            .entry(user.to_string())
            .or_insert_with(|| self.load_user(user));
        map.insert(client_msg_id.to_string(), server_msg_id.to_string());

        let path = self.user_path(user);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::Store(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(&*map)
            .map_err(|e| AppError::Store(format!("Failed to serialize idempotency map: {}", e)))?;
        std::fs::write(&tmp, raw)
            .map_err(|e| AppError::Store(format!("Failed to write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| AppError::Store(format!("Failed to commit {}: {}", path.display(), e)))?;
        Ok(())
    }
}

/// Keep user-derived filenames on a safe alphabet.
fn sanitize(user: &str) -> String {
    user.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
