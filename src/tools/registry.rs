//! Tool registry and dispatch.
//!
//! The registry holds tool descriptors, coerces and validates the raw
//! argument strings produced by models, runs handlers under their descriptor
//! deadline, and wraps every outcome (including panics) in a structured
//! envelope. No retries happen here — the orchestrator owns retry policy.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sandbox::changed_files;
use crate::types::{Result, ToolDefinition, ToolFailure, ToolOutcome};
use crate::utils::config::OrcaConfig;

/// Default deadline for fast tools.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Invocation context passed to every handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Conversation the invocation belongs to.
    pub conversation_id: String,
    /// The conversation's working directory.
    pub workdir: PathBuf,
    /// Cancelled when the deadline elapses or the turn is cancelled.
    pub cancel: CancellationToken,
}

/// A dispatchable tool.
///
/// `execute` receives the coerced argument object; the registry has already
/// checked `required_params` and primitive types against
/// `parameters_schema`. Handlers return result data or an error — they never
/// build envelopes themselves.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;

    /// Parameters that must be present in the arguments.
    fn required_params(&self) -> &[&str] {
        &[]
    }

    /// Per-invocation deadline.
    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Whether same-turn invocations may run concurrently (no side effects).
    fn pure(&self) -> bool {
        false
    }

    /// Whether the orchestrator may retry once after a timeout.
    fn retry_on_timeout(&self) -> bool {
        false
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value>;
}

/// Registry of tools, frozen after registration.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    timeout_overrides: HashMap<String, u64>,
    purity_overrides: HashMap<String, bool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout_overrides: HashMap::new(),
            purity_overrides: HashMap::new(),
        }
    }

    /// Registry with configuration overrides applied.
    pub fn with_config(config: &OrcaConfig) -> Self {
        Self {
            tools: HashMap::new(),
            timeout_overrides: config.tools.timeouts.clone(),
            purity_overrides: config.tools.pure.clone(),
        }
    }

    /// Register a tool. Only valid before serving begins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Definitions of all registered tools, for publication to an LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// All registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Whether a tool is registered.
    pub fn has_tool(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Whether same-turn calls to this tool may run concurrently.
    pub fn is_pure(&self, name: &str) -> bool {
        let Some(tool) = self.lookup(name) else {
            return false;
        };
        self.purity_overrides
            .get(tool.name())
            .copied()
            .unwrap_or_else(|| tool.pure())
    }

    /// Whether a timed-out call to this tool may be retried once.
    pub fn retries_on_timeout(&self, name: &str) -> bool {
        self.lookup(name).map(|t| t.retry_on_timeout()).unwrap_or(false)
    }

    /// Resolve a tool by name. Providers that namespace names (`ns:tool`)
    /// get a suffix lookup; the caller keeps the namespaced name verbatim
    /// for the return trip.
    fn lookup(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name).or_else(|| {
            name.rsplit_once(':')
                .and_then(|(_, suffix)| self.tools.get(suffix))
        })
    }

    fn effective_timeout(&self, tool: &Arc<dyn Tool>) -> Duration {
        self.timeout_overrides
            .get(tool.name())
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| tool.timeout())
    }

    /// Invoke a tool by name with the model's raw argument string.
    ///
    /// All failure modes come back as a `failed` envelope rather than an
    /// error: the orchestrator feeds them to the model as observations.
    pub async fn invoke(&self, name: &str, raw_args: &str, ctx: &ToolContext) -> ToolOutcome {
        let Some(tool) = self.lookup(name) else {
            return ToolOutcome::failed(
                ToolFailure::UnknownTool,
                format!("Unknown tool: {}", name),
            );
        };

        let args = match coerce_arguments(raw_args) {
            Ok(args) => args,
            Err(detail) => {
                return ToolOutcome::failed(
                    ToolFailure::MalformedArguments,
                    format!(
                        "Arguments for '{}' are not a single well-formed JSON object ({}). \
                         Expected schema: {}",
                        name,
                        detail,
                        tool.parameters_schema()
                    ),
                );
            }
        };

        let offending = validate_arguments(&args, tool.as_ref());
        if !offending.is_empty() {
            return ToolOutcome::failed(
                ToolFailure::ArgumentValidation,
                format!(
                    "Invalid arguments for '{}': {}. Expected schema: {}",
                    name,
                    offending.join("; "),
                    tool.parameters_schema()
                ),
            );
        }

        let timeout = self.effective_timeout(tool);
        let handler_cancel = ctx.cancel.child_token();
        let handler_ctx = ToolContext {
            conversation_id: ctx.conversation_id.clone(),
            workdir: ctx.workdir.clone(),
            cancel: handler_cancel.clone(),
        };
        let started_at = SystemTime::now();
        debug!(tool = tool.name(), ?timeout, "Dispatching tool");

        let handler = Arc::clone(tool);
        let task = tokio::spawn(async move { handler.execute(args, &handler_ctx).await });

        let mut outcome = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                handler_cancel.cancel();
                warn!(tool = name, ?timeout, "Tool deadline elapsed");
                ToolOutcome::failed(
                    ToolFailure::Timeout,
                    format!("Tool '{}' timed out after {}s", name, timeout.as_secs()),
                )
            }
            Ok(Err(join_error)) => {
                warn!(tool = name, error = %join_error, "Tool handler panicked");
                ToolOutcome::failed(
                    ToolFailure::HandlerFailure,
                    format!("Tool '{}' crashed: {}", name, join_error),
                )
            }
            Ok(Ok(Err(error))) => {
                ToolOutcome::failed(ToolFailure::HandlerFailure, error.to_string())
            }
            Ok(Ok(Ok(data))) => ToolOutcome::success(data, Vec::new()),
        };

        // The registry owns generated-file attribution: diff the working
        // directory over the handler's run, then union anything the handler
        // reported explicitly in its result data.
        let mut files = changed_files(&ctx.workdir, started_at, "");
        if let Some(reported) = outcome
            .data
            .get("generated_files")
            .and_then(|v| v.as_array())
        {
            for value in reported {
                if let Some(path) = value.as_str() {
                    if !files.iter().any(|f| f == path) {
                        files.push(path.to_string());
                    }
                }
            }
        }
        outcome.generated_files = files;
        outcome
    }
}

/// Coerce a raw argument string into a JSON object.
///
/// Models sometimes emit several concatenated JSON objects in one
/// `arguments` string; that is malformed and is reported (never silently
/// repaired) so the model can correct itself next iteration.
fn coerce_arguments(raw: &str) -> std::result::Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    let mut stream = serde_json::Deserializer::from_str(trimmed).into_iter::<Value>();
    let first = match stream.next() {
        Some(Ok(value)) => value,
        Some(Err(e)) => return Err(format!("invalid JSON: {}", e)),
        None => return Ok(Map::new()),
    };
    match stream.next() {
        None => {}
        Some(Ok(_)) => return Err("multiple concatenated JSON documents".to_string()),
        Some(Err(e)) => return Err(format!("trailing garbage: {}", e)),
    }
    match first {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected an object, got {}", json_type_name(&other))),
    }
}

/// Check required parameters and primitive types against the schema.
/// Returns a list of offending-field descriptions, empty when valid.
fn validate_arguments(args: &Map<String, Value>, tool: &dyn Tool) -> Vec<String> {
    let mut offending = Vec::new();
    for required in tool.required_params() {
        if !args.contains_key(*required) {
            offending.push(format!("missing required parameter '{}'", required));
        }
    }
    let schema = tool.parameters_schema();
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in args {
            let Some(expected) = properties
                .get(key)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !type_matches(expected, value) {
                offending.push(format!(
                    "parameter '{}' should be {} but was {}",
                    key,
                    expected,
                    json_type_name(value)
                ));
            }
        }
    }
    offending
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the message"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"},
                    "count": {"type": "integer"}
                },
                "required": ["message"]
            })
        }

        fn required_params(&self) -> &[&str] {
            &["message"]
        }

        fn pure(&self) -> bool {
            true
        }

        async fn execute(&self, args: Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
            Ok(json!({"echo": args["message"]}))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps forever"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(100)
        }

        async fn execute(&self, _args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
            ctx.cancel.cancelled().await;
            Ok(Value::Null)
        }
    }

    fn context(dir: &TempDir) -> ToolContext {
        ToolContext {
            conversation_id: "c1".to_string(),
            workdir: dir.path().to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(SlowTool));
        registry
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let dir = TempDir::new().unwrap();
        let outcome = registry()
            .invoke("echo", r#"{"message":"hi"}"#, &context(&dir))
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.data["echo"], "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let dir = TempDir::new().unwrap();
        let outcome = registry().invoke("nope", "{}", &context(&dir)).await;
        assert_eq!(outcome.failure, Some(ToolFailure::UnknownTool));
    }

    #[tokio::test]
    async fn test_namespaced_lookup_resolves() {
        let dir = TempDir::new().unwrap();
        let outcome = registry()
            .invoke("ext:echo", r#"{"message":"hi"}"#, &context(&dir))
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_concatenated_objects_are_malformed() {
        let dir = TempDir::new().unwrap();
        let outcome = registry()
            .invoke(
                "echo",
                r#"{"steps":[1,2]}{"message":"hi"}"#,
                &context(&dir),
            )
            .await;
        assert_eq!(outcome.failure, Some(ToolFailure::MalformedArguments));
        assert!(outcome.error.as_ref().unwrap().contains("concatenated"));
    }

    #[tokio::test]
    async fn test_missing_required_param() {
        let dir = TempDir::new().unwrap();
        let outcome = registry().invoke("echo", r#"{"count":2}"#, &context(&dir)).await;
        assert_eq!(outcome.failure, Some(ToolFailure::ArgumentValidation));
        assert!(outcome.error.as_ref().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn test_wrong_type_reported_with_field() {
        let dir = TempDir::new().unwrap();
        let outcome = registry()
            .invoke("echo", r#"{"message":"hi","count":"three"}"#, &context(&dir))
            .await;
        assert_eq!(outcome.failure, Some(ToolFailure::ArgumentValidation));
        assert!(outcome.error.as_ref().unwrap().contains("'count'"));
    }

    #[tokio::test]
    async fn test_timeout_enforced() {
        let dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        let outcome = registry().invoke("slow", "{}", &context(&dir)).await;
        assert_eq!(outcome.failure, Some(ToolFailure::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_empty_arguments_coerce_to_empty_object() {
        assert!(coerce_arguments("").unwrap().is_empty());
        assert!(coerce_arguments("  ").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generated_files_from_workdir_diff() {
        struct WriterTool;

        #[async_trait]
        impl Tool for WriterTool {
            fn name(&self) -> &str {
                "writer"
            }
            fn description(&self) -> &str {
                "Writes a file"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(&self, _args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
                std::fs::write(ctx.workdir.join("result.csv"), "a,b\n").unwrap();
                Ok(json!({"rows": 1}))
            }
        }

        let dir = TempDir::new().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WriterTool));
        let outcome = registry.invoke("writer", "{}", &context(&dir)).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.generated_files, vec!["result.csv"]);
    }

    #[test]
    fn test_definitions_sorted() {
        let definitions = registry().definitions();
        let names: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "slow"]);
    }
}
