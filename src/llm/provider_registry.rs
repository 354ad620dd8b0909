//! Named provider/model routing.
//!
//! `orca.toml` declares providers (a dialect plus endpoint/key) and models
//! (a provider reference, the provider-side model id, and capability flags).
//! The registry resolves a model name to a ready client over the shared
//! connection pool. Clients are constructed per turn and hold no state
//! beyond the in-turn thought-signature cache, so construction is cheap.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::client::LLMClient;
use crate::llm::gemini::GeminiClient;
use crate::llm::openai::OpenAIClient;
use crate::types::{AppError, Result};
use crate::utils::config::{ModelConfig, OrcaConfig, ProviderConfig};

/// Resolves a model name to a ready client plus its capability flags. The
/// orchestrator depends on this seam rather than the concrete registry so
/// tests can substitute scripted clients.
pub trait LLMClientFactoryTrait: Send + Sync {
    /// Create a client for a model name.
    fn create_client(&self, model_name: &str) -> Result<Arc<dyn LLMClient>>;

    /// Whether the model accepts tool declarations.
    fn supports_tools(&self, model_name: &str) -> bool;

    /// Model configuration, when the model is registered.
    fn model_config(&self, model_name: &str) -> Option<&ModelConfig>;

    /// The configured default model name.
    fn default_model(&self) -> &str;
}

/// Registry of configured providers and models.
pub struct ProviderRegistry {
    http: reqwest::Client,
    providers: HashMap<String, ProviderConfig>,
    models: HashMap<String, ModelConfig>,
    default_model: String,
}

impl ProviderRegistry {
    /// Build the registry from the configuration snapshot and the shared
    /// HTTP client.
    pub fn from_config(config: &OrcaConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            providers: config.providers.clone(),
            models: config.models.clone(),
            default_model: config.agent.default_model.clone(),
        }
    }

    /// The configured default model name.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Model configuration by name.
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    /// Whether a model accepts tool declarations. Unknown models default to
    /// tool-capable; the provider will reject if not.
    pub fn supports_tools(&self, name: &str) -> bool {
        self.models.get(name).map(|m| m.supports_tools).unwrap_or(true)
    }

    /// Registered model names.
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    fn build_client(&self, model_name: &str) -> Result<Arc<dyn LLMClient>> {
        let model = self.models.get(model_name).ok_or_else(|| {
            AppError::Configuration(format!("Unknown model: {}", model_name))
        })?;
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            AppError::Configuration(format!(
                "Model '{}' references unknown provider '{}'",
                model_name, model.provider
            ))
        })?;
        let api_key = provider.resolve_api_key()?;
        match provider {
            ProviderConfig::OpenAI { api_base, .. } => Ok(Arc::new(OpenAIClient::new(
                self.http.clone(),
                api_key,
                api_base.clone(),
                model.model.clone(),
            ))),
            ProviderConfig::Gemini { api_base, .. } => Ok(Arc::new(GeminiClient::new(
                self.http.clone(),
                api_key,
                api_base.clone(),
                model.model.clone(),
            ))),
        }
    }
}

impl LLMClientFactoryTrait for ProviderRegistry {
    fn create_client(&self, model_name: &str) -> Result<Arc<dyn LLMClient>> {
        self.build_client(model_name)
    }

    fn supports_tools(&self, model_name: &str) -> bool {
        ProviderRegistry::supports_tools(self, model_name)
    }

    fn model_config(&self, model_name: &str) -> Option<&ModelConfig> {
        self.model(model_name)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}
