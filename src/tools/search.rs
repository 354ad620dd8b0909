//! Web search and page fetch tools.
//!
//! Search is backed by daedra (DuckDuckGo); page fetch pulls a URL over the
//! shared HTTP client and extracts readable text with scraper. Both are
//! side-effect-free, so the orchestrator may run several in parallel within
//! one turn.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::registry::{Tool, ToolContext};
use crate::types::{AppError, Result};

/// Web search tool powered by daedra.
pub struct SearchTool;

impl SearchTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for information using DuckDuckGo"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "num_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 10)",
                    "default": 10
                }
            },
            "required": ["query"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["query"]
    }

    fn pure(&self) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'query' parameter".to_string()))?;

        let num_results = args
            .get("num_results")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(10);

        let search_args = daedra::SearchArgs {
            query: query.to_string(),
            options: Some(daedra::SearchOptions {
                num_results,
                ..Default::default()
            }),
        };

        match daedra::tools::search::perform_search(&search_args).await {
            Ok(response) => {
                let results: Vec<Value> = response
                    .data
                    .iter()
                    .map(|r| {
                        json!({
                            "title": r.title,
                            "url": r.url,
                            "description": r.description
                        })
                    })
                    .collect();

                Ok(json!({
                    "query": query,
                    "results": results,
                    "count": results.len()
                }))
            }
            Err(e) => Err(AppError::Internal(format!("Search failed: {}", e))),
        }
    }
}

/// Page fetching tool: URL in, readable text out.
pub struct FetchPageTool {
    http: reqwest::Client,
}

impl FetchPageTool {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Tool for FetchPageTool {
    fn name(&self) -> &str {
        "fetch_page"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable text content"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters of extracted text (default: 8000)",
                    "default": 8000
                }
            },
            "required": ["url"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["url"]
    }

    fn pure(&self) -> bool {
        true
    }

    async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'url' parameter".to_string()))?;
        let max_chars = args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(8000);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::External(format!("Fetch failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::External(format!("Fetch failed: HTTP {}", status)));
        }
        let html = response
            .text()
            .await
            .map_err(|e| AppError::External(format!("Fetch failed: {}", e)))?;

        let mut text = extract_text(&html);
        if text.len() > max_chars {
            let mut cut = max_chars;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...");
        }

        Ok(json!({
            "url": url,
            "text": text,
        }))
    }
}

/// Strip markup and collapse whitespace.
fn extract_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let selector = scraper::Selector::parse("body").unwrap();
    let body_text: String = match document.select(&selector).next() {
        Some(body) => body.text().collect::<Vec<_>>().join(" "),
        None => document.root_element().text().collect::<Vec<_>>().join(" "),
    };
    body_text.split_whitespace().collect::<Vec<_>>().join(" ")
}
