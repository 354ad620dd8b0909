//! Workspace file endpoints: listing and range streaming.
//!
//! Generated files are served straight from the conversation's working
//! directory with `Range` support (HTTP 206) so the UI can scrub media.
//! `Content-Disposition` is sent without a `filename` parameter: non-ASCII
//! names corrupt in that header, and the URL path already carries the name.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::store::workdir::safe_join;
use crate::types::{AppError, FileListing, Result};
use crate::AppState;

/// List the files in a conversation's working directory.
#[utoipa::path(
    get,
    path = "/api/outputs/list/{conversation_id}",
    params(("conversation_id" = String, Path, description = "Conversation ID")),
    responses((status = 200, description = "Workspace file listing", body = FileListing)),
    tag = "files"
)]
pub async fn list_outputs(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<FileListing>> {
    let files = state.store.list_files(&conversation_id)?;
    Ok(Json(FileListing { files }))
}

/// Stream a workspace file, honoring a `Range` header.
#[utoipa::path(
    get,
    path = "/api/stream/{conversation_id}/{filename}",
    params(
        ("conversation_id" = String, Path, description = "Conversation ID"),
        ("filename" = String, Path, description = "File path relative to the workspace")
    ),
    responses(
        (status = 200, description = "Whole file"),
        (status = 206, description = "Requested byte range"),
        (status = 404, description = "File not found"),
        (status = 416, description = "Range not satisfiable")
    ),
    tag = "files"
)]
pub async fn stream_file(
    State(state): State<AppState>,
    Path((conversation_id, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let workdir = state.store.workdir(&conversation_id)?;
    let path = safe_join(&workdir, &filename)?;

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| AppError::NotFound(format!("File not found: {}", filename)))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(format!("Cannot stat file: {}", e)))?
        .len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| parse_range(raw, len));

    let (status, start, end) = match range {
        None => (StatusCode::OK, 0, len.saturating_sub(1)),
        Some(Some((start, end))) => (StatusCode::PARTIAL_CONTENT, start, end),
        Some(None) => {
            return Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", len))],
            )
                .into_response());
        }
    };

    let count = if len == 0 { 0 } else { end - start + 1 };
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| AppError::Internal(format!("Seek failed: {}", e)))?;
    let mut buffer = vec![0u8; count as usize];
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| AppError::Internal(format!("Read failed: {}", e)))?;

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type_for(&filename))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, count)
        // No filename parameter: see module docs.
        .header(header::CONTENT_DISPOSITION, "attachment");
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end, len),
        );
    }
    response
        .body(Body::from(buffer))
        .map_err(|e| AppError::Internal(format!("Response build failed: {}", e)))
}

/// Parse a `bytes=start-end` header against a file of `len` bytes. Returns
/// `None` for unsatisfiable or malformed ranges.
fn parse_range(raw: &str, len: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    if len == 0 {
        return None;
    }
    match (start_raw.is_empty(), end_raw.is_empty()) {
        // bytes=-suffix: final N bytes
        (true, false) => {
            let suffix: u64 = end_raw.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            let start = len.saturating_sub(suffix);
            Some((start, len - 1))
        }
        // bytes=start-
        (false, true) => {
            let start: u64 = start_raw.parse().ok()?;
            (start < len).then_some((start, len - 1))
        }
        // bytes=start-end
        (false, false) => {
            let start: u64 = start_raw.parse().ok()?;
            let end: u64 = end_raw.parse().ok()?;
            (start <= end && start < len).then_some((start, end.min(len - 1)))
        }
        (true, true) => None,
    }
}

fn content_type_for(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or_default() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "csv" => "text/csv",
        "txt" | "md" => "text/plain; charset=utf-8",
        "html" => "text/html; charset=utf-8",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse_range("bytes=-100", 1000), Some((900, 999)));
        // end clamped to file length
        assert_eq!(parse_range("bytes=900-2000", 1000), Some((900, 999)));
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        assert_eq!(parse_range("bytes=-0", 1000), None);
        assert_eq!(parse_range("items=0-5", 1000), None);
        assert_eq!(parse_range("bytes=0-5", 0), None);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for("chart.png"), "image/png");
        assert_eq!(content_type_for("数据.csv"), "text/csv");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
