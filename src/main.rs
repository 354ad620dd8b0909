//! O.R.C.A Server Binary
//!
//! This is the main entry point for running O.R.C.A as a standalone server.
//! For library usage, import from the `orca` crate instead.

use orca::{api, AppState, ConversationStore, OrcaConfig, ProviderRegistry};
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

const CONFIG_FILE: &str = "orca.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env for secrets (provider API keys)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting O.R.C.A - Orchestrated Reasoning Conversational Agent");

    // =================================================================
    // Load Configuration
    // =================================================================
    // The server REQUIRES orca.toml to exist. Panic if it doesn't.
    if !std::path::Path::new(CONFIG_FILE).exists() {
        panic!(
            "Configuration file '{}' not found!\n\
             O.R.C.A requires orca.toml to run.\n\
             Copy orca.example.toml to orca.toml and customize it.",
            CONFIG_FILE
        );
    }
    let config = Arc::new(
        OrcaConfig::load(CONFIG_FILE).expect("Failed to load orca.toml - check for syntax errors"),
    );
    tracing::info!("Configuration loaded from {}", CONFIG_FILE);

    // =================================================================
    // Shared HTTP client (provider calls, fetch/media tools)
    // =================================================================
    let http = orca::utils::config::build_http_client(&config.http)
        .expect("Failed to build HTTP client");

    // =================================================================
    // Initialize Provider Registry
    // =================================================================
    let provider_registry = Arc::new(ProviderRegistry::from_config(&config, http.clone()));
    tracing::info!(
        "Provider registry initialized with {} providers, {} models",
        config.providers.len(),
        config.models.len()
    );

    // =================================================================
    // Initialize Conversation Store
    // =================================================================
    let store = Arc::new(
        ConversationStore::new(&config.storage.data_dir, &config.storage.outputs_dir)
            .expect("Failed to initialize conversation store"),
    );
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        outputs_dir = %config.storage.outputs_dir.display(),
        "Conversation store initialized"
    );

    // =================================================================
    // Initialize Tool Registry
    // =================================================================
    let tool_registry = Arc::new(
        orca::tools::build_registry(&config, http).expect("Failed to build tool registry"),
    );
    tracing::info!(
        "Tool registry initialized with {} tools",
        tool_registry.tool_names().len()
    );

    // =================================================================
    // Create Application State
    // =================================================================
    let state = AppState {
        config: Arc::clone(&config),
        store,
        tool_registry,
        provider_registry,
        active_turns: Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new())),
    };

    // =================================================================
    // Build OpenAPI Documentation
    // =================================================================
    #[derive(OpenApi)]
    #[openapi(
        paths(
            orca::api::handlers::chat::chat,
            orca::api::handlers::chat::cancel_turn,
            orca::api::handlers::conversations::list_conversations,
            orca::api::handlers::conversations::get_conversation,
            orca::api::handlers::files::list_outputs,
            orca::api::handlers::files::stream_file,
        ),
        components(schemas(
            orca::types::ChatRequest,
            orca::types::DoneEvent,
            orca::types::FileEntry,
            orca::types::FileListing,
            orca::store::ConversationSummary,
            orca::api::handlers::conversations::ConversationDetails,
        )),
        tags(
            (name = "chat", description = "Chat ingress and cancellation"),
            (name = "conversations", description = "Conversation reads"),
            (name = "files", description = "Workspace files"),
        ),
        info(
            title = "O.R.C.A - Orchestrated Reasoning Conversational Agent API",
            version = "0.3.0",
            description = "Multi-tool agent server with a ReAct loop and SSE streaming"
        )
    )]
    struct ApiDoc;

    // =================================================================
    // Build Router
    // =================================================================
    // The request deadline must exceed the longest tool timeout (600 s for
    // media generation) with margin, or long tool runs die at the HTTP layer.
    let request_timeout = Duration::from_secs(config.server.request_timeout_secs);
    let app = Router::new()
        // Health check
        .route("/health", get(health_check))
        // Configuration info endpoint
        .route("/config/info", get(config_info))
        // OpenAPI document
        .route(
            "/api-docs/openapi.json",
            get(|| async { axum::Json(ApiDoc::openapi()) }),
        )
        // API routes
        .nest("/api", api::routes::create_router())
        // Add middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        // Add state
        .with_state(state);

    // =================================================================
    // Start Server
    // =================================================================
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server running on http://{}", addr);
    tracing::info!("OpenAPI document at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Configuration info endpoint (non-sensitive info only)
async fn config_info(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    let config = &state.config;
    axum::Json(serde_json::json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port,
            "log_level": config.server.log_level,
            "request_timeout_secs": config.server.request_timeout_secs,
        },
        "providers": config.providers.keys().collect::<Vec<_>>(),
        "models": config.models.keys().collect::<Vec<_>>(),
        "default_model": config.agent.default_model,
        "max_iterations": config.agent.max_iterations,
        "tools": state.tool_registry.tool_names(),
    }))
}
