//! TOML-based configuration for O.R.C.A.
//!
//! This module provides declarative configuration for the server, storage
//! paths, LLM providers/models, and tools via a TOML file (`orca.toml`).
//!
//! The configuration is an immutable snapshot taken at startup. Secrets are
//! never stored in the file: provider sections name the environment variable
//! that carries the key (`api_key_env`), and `.env` is loaded by the binary
//! before the snapshot is taken.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::{AppError, Result};

/// Root configuration structure loaded from orca.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrcaConfig {
    /// HTTP server configuration (bind address, deadlines).
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage paths for conversations and working directories.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Named LLM provider configurations.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Named model configurations that reference providers.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Turn-driver configuration (default model, iteration budget).
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool configuration (timeout overrides, media endpoint).
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Outbound HTTP configuration (proxy bypass).
    #[serde(default)]
    pub http: HttpConfig,
}

// ============= Server Configuration =============

/// Server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to (default: "127.0.0.1").
    #[serde(default = "default_host")]
    pub host: String,

    /// Port number to listen on (default: 3000).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Per-request deadline in seconds. Must exceed the longest tool timeout
    /// by a safety margin (default: 650, vs. the 600 s media tool tier).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// SSE heartbeat interval in seconds (default: 15).
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    650
}

fn default_heartbeat() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            request_timeout_secs: default_request_timeout(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

// ============= Storage Configuration =============

/// Storage paths for conversation records and working directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for conversation records, the index, and idempotency maps
    /// (default: "./data").
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root for per-conversation working directories (default: "./outputs").
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_outputs_dir() -> PathBuf {
    PathBuf::from("./outputs")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            outputs_dir: default_outputs_dir(),
        }
    }
}

// ============= Provider Configuration =============

/// LLM provider configuration. Tagged enum based on provider dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// OpenAI-style Chat Completions API (or compatible endpoints).
    OpenAI {
        /// Environment variable containing the API key.
        api_key_env: String,
        /// API base URL (default: `https://api.openai.com/v1`).
        #[serde(default = "default_openai_base")]
        api_base: String,
    },
    /// Gemini-native `generateContent` API.
    Gemini {
        /// Environment variable containing the API key.
        api_key_env: String,
        /// API base URL (default: `https://generativelanguage.googleapis.com/v1beta`).
        #[serde(default = "default_gemini_base")]
        api_base: String,
    },
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_gemini_base() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

impl ProviderConfig {
    /// Resolve the API key from the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        let env_name = match self {
            ProviderConfig::OpenAI { api_key_env, .. } => api_key_env,
            ProviderConfig::Gemini { api_key_env, .. } => api_key_env,
        };
        std::env::var(env_name).map_err(|_| {
            AppError::Configuration(format!(
                "API key environment variable '{}' is not set",
                env_name
            ))
        })
    }
}

// ============= Model Configuration =============

/// A named model routed to one of the configured providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name of the provider entry to use.
    pub provider: String,

    /// Provider-side model identifier (e.g., "gpt-4o-mini").
    pub model: String,

    /// Whether the model accepts tool declarations. Some preview models
    /// reject tool messages entirely; those run as plain chat.
    #[serde(default = "default_supports_tools")]
    pub supports_tools: bool,

    /// Sampling temperature, if overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum completion tokens, if overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_supports_tools() -> bool {
    true
}

// ============= Agent Configuration =============

/// Turn-driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model name used when the request does not specify one.
    #[serde(default = "default_model_name")]
    pub default_model: String,

    /// Hard cap on REASON iterations per turn (default: 30).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Optional system prompt prepended to every turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_model_name() -> String {
    "default".to_string()
}

fn default_max_iterations() -> u32 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: default_model_name(),
            max_iterations: default_max_iterations(),
            system_prompt: None,
        }
    }
}

// ============= Tools Configuration =============

/// Tool configuration: enablement, timeout overrides, media endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    /// Tools to register. Empty means all built-ins.
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Per-tool timeout overrides in seconds, keyed by tool name.
    #[serde(default)]
    pub timeouts: HashMap<String, u64>,

    /// Per-tool purity overrides (whether same-turn calls may run
    /// concurrently), keyed by tool name.
    #[serde(default)]
    pub pure: HashMap<String, bool>,

    /// Media generation endpoint, if the `generate_media` tool is wanted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaConfig>,
}

/// OpenAI-compatible image generation endpoint for the media tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Environment variable containing the API key.
    pub api_key_env: String,

    /// API base URL (default: `https://api.openai.com/v1`).
    #[serde(default = "default_openai_base")]
    pub api_base: String,

    /// Model identifier for generation requests.
    pub model: String,
}

// ============= Outbound HTTP Configuration =============

/// Outbound HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpConfig {
    /// Hosts reached directly even when a proxy is configured in the
    /// environment (internal endpoints).
    #[serde(default)]
    pub proxy_bypass: Vec<String>,
}

// ============= Loading =============

impl OrcaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: OrcaConfig = toml::from_str(&raw).map_err(|e| {
            AppError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation that serde cannot express.
    fn validate(&self) -> Result<()> {
        for (name, model) in &self.models {
            if !self.providers.contains_key(&model.provider) {
                return Err(AppError::Configuration(format!(
                    "Model '{}' references unknown provider '{}'",
                    name, model.provider
                )));
            }
        }
        if !self.models.is_empty() && !self.models.contains_key(&self.agent.default_model) {
            return Err(AppError::Configuration(format!(
                "Default model '{}' is not defined in [models]",
                self.agent.default_model
            )));
        }
        Ok(())
    }

    /// Look up a model by name.
    pub fn get_model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    /// Timeout override for a tool, if configured.
    pub fn tool_timeout_secs(&self, tool: &str) -> Option<u64> {
        self.tools.timeouts.get(tool).copied()
    }
}

/// Build the shared outbound HTTP client, honoring proxy environment
/// variables with the configured bypass list.
pub fn build_http_client(http: &HttpConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if !http.proxy_bypass.is_empty() {
        let no_proxy = reqwest::NoProxy::from_string(&http.proxy_bypass.join(","));
        if let Ok(proxy_url) = std::env::var("HTTPS_PROXY").or_else(|_| std::env::var("https_proxy"))
        {
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| AppError::Configuration(format!("Invalid proxy URL: {}", e)))?
                .no_proxy(no_proxy);
            builder = builder.proxy(proxy);
        }
    }
    builder
        .build()
        .map_err(|e| AppError::Configuration(format!("Failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrcaConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.request_timeout_secs, 650);
        assert_eq!(config.server.heartbeat_secs, 15);
        assert_eq!(config.agent.max_iterations, 30);
        assert_eq!(config.storage.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
            [server]
            port = 8080

            [providers.main]
            type = "openai"
            api_key_env = "OPENAI_API_KEY"

            [models.default]
            provider = "main"
            model = "gpt-4o-mini"

            [agent]
            default_model = "default"
        "#;
        let config: OrcaConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.get_model("default").unwrap().supports_tools);
        match config.providers.get("main").unwrap() {
            ProviderConfig::OpenAI { api_base, .. } => {
                assert_eq!(api_base, "https://api.openai.com/v1");
            }
            other => panic!("unexpected provider: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_dangling_model() {
        let toml_str = r#"
            [models.default]
            provider = "nope"
            model = "gpt-4o-mini"
        "#;
        let config: OrcaConfig = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tool_timeout_override() {
        let toml_str = r#"
            [tools.timeouts]
            execute_code = 120
        "#;
        let config: OrcaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tool_timeout_secs("execute_code"), Some(120));
        assert_eq!(config.tool_timeout_secs("web_search"), None);
    }
}
