//! Media generation tool.
//!
//! Calls an OpenAI-compatible image generation endpoint and writes the
//! decoded result into the conversation's working directory, where the
//! range-streaming endpoint can serve it. Generation is slow; this tool sits
//! in the long timeout tier, and the server's request deadline is sized
//! above it.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::store::workdir::safe_join;
use crate::tools::registry::{Tool, ToolContext};
use crate::types::{AppError, Result};
use crate::utils::config::MediaConfig;

/// Image generation tool against an OpenAI-compatible endpoint.
pub struct GenerateMediaTool {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    model: String,
}

impl GenerateMediaTool {
    /// Build from the `[tools.media]` configuration section.
    pub fn from_config(http: reqwest::Client, config: &MediaConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            AppError::Configuration(format!(
                "API key environment variable '{}' is not set",
                config.api_key_env
            ))
        })?;
        Ok(Self {
            http,
            api_key,
            api_base: config.api_base.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
}

#[async_trait]
impl Tool for GenerateMediaTool {
    fn name(&self) -> &str {
        "generate_media"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt and save it into the \
         conversation workspace"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "Text description of the image to generate"
                },
                "filename": {
                    "type": "string",
                    "description": "Output filename (default: generated-<n>.png)"
                }
            },
            "required": ["prompt"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["prompt"]
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'prompt' parameter".to_string()))?;
        let filename = args
            .get("filename")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("generated-{}.png", uuid::Uuid::new_v4().simple()));
        let target = safe_join(&ctx.workdir, &filename)?;

        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "n": 1,
            "response_format": "b64_json",
        });
        let response = self
            .http
            .post(format!(
                "{}/images/generations",
                self.api_base.trim_end_matches('/')
            ))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::External(format!("Media generation failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::External(format!(
                "Media generation failed: HTTP {}: {}",
                status, text
            )));
        }
        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| AppError::External(format!("Malformed media response: {}", e)))?;
        let b64 = parsed
            .data
            .first()
            .and_then(|d| d.b64_json.as_deref())
            .ok_or_else(|| AppError::External("Media response carried no image".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| AppError::External(format!("Invalid image payload: {}", e)))?;

        tokio::fs::write(&target, &bytes)
            .await
            .map_err(|e| AppError::Internal(format!("Cannot write '{}': {}", filename, e)))?;

        Ok(json!({
            "file": filename,
            "bytes": bytes.len(),
            "generated_files": [filename],
        }))
    }
}
