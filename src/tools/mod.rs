//! Built-in tools and the tool registry.

/// Code and shell execution.
pub mod code;
/// Workspace file I/O.
pub mod files;
/// Media generation.
pub mod media;
/// Task planning artifact.
pub mod plan;
/// Registry, dispatch, validation.
pub mod registry;
/// Web search and page fetch.
pub mod search;

pub use registry::{Tool, ToolContext, ToolRegistry};

use crate::sandbox::SandboxExecutor;
use crate::types::Result;
use crate::utils::config::OrcaConfig;
use std::sync::Arc;
use tracing::warn;

/// Build the registry with all built-in tools, honoring the `[tools]`
/// enablement list (empty list = everything).
pub fn build_registry(config: &OrcaConfig, http: reqwest::Client) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::with_config(config);
    let executor = SandboxExecutor::new();

    let wanted = |name: &str| {
        config.tools.enabled.is_empty() || config.tools.enabled.iter().any(|t| t == name)
    };

    if wanted("web_search") {
        registry.register(Arc::new(search::SearchTool::new()));
    }
    if wanted("fetch_page") {
        registry.register(Arc::new(search::FetchPageTool::new(http.clone())));
    }
    if wanted("execute_code") {
        registry.register(Arc::new(code::ExecuteCodeTool::new(executor.clone())));
    }
    if wanted("execute_shell") {
        registry.register(Arc::new(code::ExecuteShellTool::new(executor)));
    }
    if wanted("read_file") {
        registry.register(Arc::new(files::ReadFileTool));
    }
    if wanted("write_file") {
        registry.register(Arc::new(files::WriteFileTool));
    }
    if wanted("plan") {
        registry.register(Arc::new(plan::PlanTool));
    }
    if wanted("generate_media") {
        match &config.tools.media {
            Some(media_config) => {
                registry.register(Arc::new(media::GenerateMediaTool::from_config(
                    http, media_config,
                )?));
            }
            None if config.tools.enabled.iter().any(|t| t == "generate_media") => {
                warn!("generate_media enabled but [tools.media] is not configured; skipping");
            }
            None => {}
        }
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_registry_defaults() {
        let registry = build_registry(&OrcaConfig::default(), reqwest::Client::new()).unwrap();
        for name in [
            "web_search",
            "fetch_page",
            "execute_code",
            "execute_shell",
            "read_file",
            "write_file",
            "plan",
        ] {
            assert!(registry.has_tool(name), "missing {}", name);
        }
        // No [tools.media] section, no media tool
        assert!(!registry.has_tool("generate_media"));
    }

    #[test]
    fn test_build_registry_enablement_filter() {
        let config: OrcaConfig = toml::from_str(
            r#"
            [tools]
            enabled = ["web_search"]
        "#,
        )
        .unwrap();
        let registry = build_registry(&config, reqwest::Client::new()).unwrap();
        assert!(registry.has_tool("web_search"));
        assert!(!registry.has_tool("execute_code"));
    }
}
