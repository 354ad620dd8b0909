//! Workspace file I/O tools.
//!
//! Reads and writes are confined to the conversation's working directory via
//! `safe_join`; traversal attempts come back as validation errors, not
//! filesystem effects.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::store::workdir::safe_join;
use crate::tools::registry::{Tool, ToolContext};
use crate::types::{AppError, Result};

/// Cap on file content returned to the model.
const READ_CAP: usize = 256 * 1024;

/// Read a file from the conversation workspace.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the conversation workspace"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace"
                }
            },
            "required": ["path"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["path"]
    }

    fn pure(&self) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'path' parameter".to_string()))?;
        let resolved = safe_join(&ctx.workdir, path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| AppError::NotFound(format!("Cannot read '{}': {}", path, e)))?;
        let truncated = bytes.len() > READ_CAP;
        let content = String::from_utf8_lossy(&bytes[..bytes.len().min(READ_CAP)]).into_owned();
        Ok(json!({
            "path": path,
            "content": content,
            "truncated": truncated,
        }))
    }
}

/// Write a file into the conversation workspace.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a text file into the conversation workspace"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Text content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["path", "content"]
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'path' parameter".to_string()))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'content' parameter".to_string()))?;
        let resolved = safe_join(&ctx.workdir, path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(format!("Cannot create directory: {}", e)))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| AppError::Internal(format!("Cannot write '{}': {}", path, e)))?;
        Ok(json!({
            "path": path,
            "bytes": content.len(),
        }))
    }
}
