//! Working-directory change-set detection.
//!
//! A file belongs to the change set when its mtime is at or after the
//! execution start (minus a small tolerance for filesystem clock skew), or
//! when the subprocess reported it explicitly on stdout with the sentinel
//! prefix. mtime comparison, not presence comparison: a re-rendered
//! `chart.png` that already existed must still be reported.

use std::path::Path;
use std::time::{Duration, SystemTime};

/// Stdout lines with this prefix name files the subprocess wants attached
/// even if the mtime scan would miss them (e.g. files written through a
/// library that preserves timestamps).
pub const FILE_SENTINEL: &str = "@@generated-file:";

/// Tolerance for filesystem clock skew.
const MTIME_EPSILON: Duration = Duration::from_millis(5);

/// Scan `workdir` for regular files modified at or after `started_at`, and
/// union in sentinel-reported paths from `stdout`. Paths are relative to
/// `workdir`, in first-seen order (scan order, then sentinel additions).
/// Dotfiles are excluded from the scan.
pub fn changed_files(workdir: &Path, started_at: SystemTime, stdout: &str) -> Vec<String> {
    let threshold = started_at
        .checked_sub(MTIME_EPSILON)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(workdir)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let Ok(meta) = entry.metadata() else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        if mtime >= threshold {
            if let Ok(rel) = entry.path().strip_prefix(workdir) {
                files.push(rel.to_string_lossy().to_string());
            }
        }
    }
    files.sort();

    for line in stdout.lines() {
        if let Some(path) = line.trim().strip_prefix(FILE_SENTINEL) {
            let path = path.trim().to_string();
            if !path.is_empty() && !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
        && entry.depth() > 0
}
