//! # O.R.C.A - Orchestrated Reasoning Conversational Agent
//!
//! A multi-tool conversational agent server built in Rust: a ReAct loop over
//! pluggable LLM provider dialects, tool dispatch with per-tool deadlines, a
//! sandboxed code executor, file-backed conversation history, and SSE
//! progress streaming.
//!
//! ## Overview
//!
//! O.R.C.A can be used in two ways:
//!
//! 1. **As a standalone server** - Run the `orca-server` binary
//! 2. **As a library** - Import components into your own Rust project
//!
//! ## Quick Start (Library Usage)
//!
//! ```rust,ignore
//! use orca::{ConversationStore, ProviderRegistry, ToolRegistry};
//! use std::sync::Arc;
//!
//! let config = orca::OrcaConfig::load("orca.toml")?;
//! let http = orca::utils::config::build_http_client(&config.http)?;
//! let store = Arc::new(ConversationStore::new(
//!     &config.storage.data_dir,
//!     &config.storage.outputs_dir,
//! )?);
//! let providers = Arc::new(ProviderRegistry::from_config(&config, http.clone()));
//! let tools = Arc::new(orca::tools::build_registry(&config, http)?);
//! ```
//!
//! ## Modules
//!
//! - [`agents`] - ReAct turn driver and progress events
//! - [`api`] - HTTP handlers and routes (chat SSE, files, conversations)
//! - [`llm`] - LLM client dialects (Chat Completions, Gemini-native)
//! - [`sandbox`] - Confined subprocess execution with change-set detection
//! - [`store`] - File-backed conversation storage with idempotent ingest
//! - [`tools`] - Tool registry and built-in tools
//! - [`types`] - Common types and error handling
//! - [`utils`] - Configuration
//!
//! ## Data flow for one user turn
//!
//! The chat handler inserts the user message idempotently, creates an
//! assistant placeholder, and spawns the orchestrator. The orchestrator
//! loops reason → dispatch → observe, streaming progress events the handler
//! forwards as SSE, then finalizes the placeholder with the assistant's
//! answer and the union of generated files — whether or not the client is
//! still connected.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

/// ReAct turn orchestration.
pub mod agents;
/// HTTP API handlers and routes.
pub mod api;
/// LLM provider clients and abstractions.
pub mod llm;
/// Sandboxed code/shell execution.
pub mod sandbox;
/// Conversation storage.
pub mod store;
/// Tool registry and built-in tools.
pub mod tools;
/// Core types (requests, responses, errors).
pub mod types;
/// Configuration utilities.
pub mod utils;

// Re-export commonly used types
pub use agents::{ReactAgent, TurnOutcome};
pub use llm::{LLMClient, LLMClientFactoryTrait, ProviderRegistry};
pub use sandbox::SandboxExecutor;
pub use store::ConversationStore;
pub use tools::ToolRegistry;
pub use types::{AppError, Result};
pub use utils::config::OrcaConfig;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration snapshot taken at startup.
    pub config: Arc<OrcaConfig>,
    /// Conversation storage.
    pub store: Arc<ConversationStore>,
    /// Tool registry, frozen after startup registration.
    pub tool_registry: Arc<ToolRegistry>,
    /// Provider/model routing.
    pub provider_registry: Arc<ProviderRegistry>,
    /// Cancellation tokens of in-flight turns, keyed by conversation id.
    pub active_turns: Arc<Mutex<HashMap<String, CancellationToken>>>,
}
