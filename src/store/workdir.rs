//! Working-directory helpers.
//!
//! Every conversation owns `outputs/<conversation_id>/`; all filenames stored
//! in messages are relative to that root. Path resolution refuses traversal
//! out of the root, so a tool argument like `../escape.txt` cannot reach a
//! sibling conversation's files.

use std::path::{Component, Path, PathBuf};

use crate::types::{AppError, FileEntry, Result};

/// Resolve `name` inside `workdir`, rejecting absolute paths and any `..`
/// component.
pub fn safe_join(workdir: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    if rel.is_absolute() {
        return Err(AppError::InvalidInput(format!(
            "Absolute paths are not allowed: {}",
            name
        )));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(AppError::InvalidInput(format!(
                    "Path escapes the working directory: {}",
                    name
                )))
            }
        }
    }
    Ok(workdir.join(rel))
}

/// List regular files in `workdir` (recursive), sorted by name.
pub fn list_entries(workdir: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    if !workdir.exists() {
        return Ok(entries);
    }
    for entry in walkdir::WalkDir::new(workdir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let meta = entry
            .metadata()
            .map_err(|e| AppError::Store(format!("Failed to stat {}: {}", entry.path().display(), e)))?;
        let name = entry
            .path()
            .strip_prefix(workdir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        let mtime: chrono::DateTime<chrono::Utc> = meta
            .modified()
            .map(Into::into)
            .unwrap_or_else(|_| chrono::Utc::now());
        entries.push(FileEntry {
            name,
            size: meta.len(),
            mtime: mtime.to_rfc3339(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
