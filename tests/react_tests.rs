//! Integration tests for the ReAct turn driver.
//!
//! These drive whole turns against a scripted LLM client and real store,
//! registry, and working directory, then assert on the persisted message
//! log, the progress event stream, and the generated-file union.

mod common;

use async_trait::async_trait;
use common::mocks::{text_reply, tool_reply, MockFactory, MockLLMClient};
use orca::agents::{progress_channel, ProgressEvent, ReactAgent, TurnOutcome};
use orca::store::ConversationStore;
use orca::tools::registry::{Tool, ToolContext, ToolRegistry};
use orca::types::{MessageRole, MessageStatus, Result};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct FakeSearchTool;

#[async_trait]
impl Tool for FakeSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Fake search"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
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
        Ok(json!({"results": [{"title": "hit", "query": args["query"]}]}))
    }
}

struct FileWriterTool;

#[async_trait]
impl Tool for FileWriterTool {
    fn name(&self) -> &str {
        "make_file"
    }
    fn description(&self) -> &str {
        "Writes the named file"
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }
    fn required_params(&self) -> &[&str] {
        &["path"]
    }
    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let path = args["path"].as_str().unwrap_or("out.txt");
        std::fs::write(ctx.workdir.join(path), "bytes").unwrap();
        Ok(json!({"written": path}))
    }
}

/// Times out on the first call, succeeds on later calls.
struct FlakyTool {
    attempts: AtomicU32,
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "Slow once, then fast"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn timeout(&self) -> Duration {
        Duration::from_millis(100)
    }
    fn retry_on_timeout(&self) -> bool {
        true
    }
    async fn execute(&self, _args: Map<String, Value>, _ctx: &ToolContext) -> Result<Value> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(json!({"ok": true}))
    }
}

struct Harness {
    _tmp: TempDir,
    store: Arc<ConversationStore>,
    registry: Arc<ToolRegistry>,
}

fn harness(tools: Vec<Arc<dyn Tool>>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(
        ConversationStore::new(tmp.path().join("data"), tmp.path().join("outputs")).unwrap(),
    );
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    Harness {
        _tmp: tmp,
        store,
        registry: Arc::new(registry),
    }
}

impl Harness {
    fn agent(&self, client: Arc<MockLLMClient>, max_iterations: u32) -> ReactAgent {
        ReactAgent::new(
            self.store.clone(),
            self.registry.clone(),
            Arc::new(MockFactory::new(client)),
            max_iterations,
            None,
        )
    }

    fn seed_turn(&self, conversation_id: &str, content: &str) -> String {
        self.store
            .append_user_message(conversation_id, "alice", content, "m1")
            .unwrap();
        self.store
            .create_assistant_placeholder(conversation_id, "alice")
            .unwrap()
    }
}

async fn run_and_collect(
    agent: &ReactAgent,
    conversation_id: &str,
    placeholder: &str,
) -> (TurnOutcome, Vec<ProgressEvent>) {
    let (tx, mut rx) = progress_channel();
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let outcome = agent
        .run_turn(
            conversation_id,
            placeholder,
            "mock-model",
            tx,
            CancellationToken::new(),
        )
        .await;
    let events = collector.await.unwrap();
    (outcome, events)
}

fn count_events(events: &[ProgressEvent], pred: impl Fn(&ProgressEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn test_simple_tool_success_turn() {
    let harness = harness(vec![Arc::new(FakeSearchTool)]);
    let placeholder = harness.seed_turn("c1", "search current weather in Chicago");

    let client = Arc::new(MockLLMClient::scripted(vec![
        tool_reply("call_1", "web_search", r#"{"query":"weather Chicago"}"#),
        text_reply("It is sunny in Chicago."),
    ]));
    let agent = harness.agent(client, 30);
    let (outcome, events) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.status, MessageStatus::Completed);
    assert_eq!(outcome.final_content, "It is sunny in Chicago.");

    // Persisted log: user, assistant(tool_calls), tool, assistant(final)
    let conversation = harness.store.get("c1").unwrap();
    let roles: Vec<MessageRole> = conversation.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant
        ]
    );
    assert_eq!(conversation.messages[1].tool_calls[0].name, "web_search");
    assert_eq!(
        conversation.messages[2].tool_call_id.as_deref(),
        Some("call_1")
    );
    let last = conversation.messages.last().unwrap();
    assert_eq!(last.status, MessageStatus::Completed);
    assert_eq!(last.content, "It is sunny in Chicago.");

    // Exactly one started/result pair, and a terminal done
    assert_eq!(
        count_events(&events, |e| matches!(e, ProgressEvent::ToolCallStarted { .. })),
        1
    );
    assert_eq!(
        count_events(&events, |e| matches!(e, ProgressEvent::ToolCallResult { .. })),
        1
    );
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Done { status, .. }) if status == "completed"
    ));
}

#[tokio::test]
async fn test_malformed_concatenated_arguments_self_correct() {
    let harness = harness(vec![Arc::new(FakeSearchTool)]);
    let placeholder = harness.seed_turn("c1", "search something");

    let client = Arc::new(MockLLMClient::scripted(vec![
        // Concatenated objects: a known model failure mode
        tool_reply("call_1", "web_search", r#"{"steps":[1,2]}{"query":"x"}"#),
        tool_reply("call_2", "web_search", r#"{"query":"x"}"#),
        text_reply("done"),
    ]));
    let agent = harness.agent(client, 30);
    let (outcome, events) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.status, MessageStatus::Completed);

    let conversation = harness.store.get("c1").unwrap();
    let tool_messages: Vec<_> = conversation
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    // First observation is the malformed-arguments error, fed back verbatim
    assert!(tool_messages[0].content.contains("well-formed"));
    // Second observation is the successful result
    assert!(tool_messages[1].content.contains("results"));

    let failed = events.iter().any(
        |e| matches!(e, ProgressEvent::ToolCallResult { status, .. } if status == "failed"),
    );
    assert!(failed);
}

#[tokio::test]
async fn test_iteration_budget_exhaustion() {
    let harness = harness(vec![Arc::new(FakeSearchTool)]);
    let placeholder = harness.seed_turn("c1", "loop forever");

    // The model calls the tool on every iteration; the scripted queue is
    // longer than the budget, and the summary request at the end consumes a
    // text reply.
    let mut replies = Vec::new();
    for i in 0..10 {
        replies.push(tool_reply(
            &format!("call_{}", i),
            "web_search",
            r#"{"query":"again"}"#,
        ));
    }
    replies.push(text_reply("I searched repeatedly but found no answer."));
    let client = Arc::new(MockLLMClient::scripted(replies));

    let agent = harness.agent(client, 3);
    let (outcome, events) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.status, MessageStatus::Completed);
    assert!(outcome.final_content.contains("Iteration budget of 3"));

    // Exactly budget-many dispatches happened
    assert_eq!(
        count_events(&events, |e| matches!(e, ProgressEvent::ToolCallStarted { .. })),
        3
    );
    let conversation = harness.store.get("c1").unwrap();
    assert_eq!(
        conversation
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .count(),
        3
    );
    assert_eq!(
        conversation.messages.last().unwrap().status,
        MessageStatus::Completed
    );
}

#[tokio::test]
async fn test_generated_files_union_in_first_seen_order() {
    let harness = harness(vec![Arc::new(FileWriterTool)]);
    let placeholder = harness.seed_turn("c1", "make some files");

    let client = Arc::new(MockLLMClient::scripted(vec![
        tool_reply("call_1", "make_file", r#"{"path":"chart.png"}"#),
        tool_reply("call_2", "make_file", r#"{"path":"data.csv"}"#),
        // Overwrite: the same file must not appear twice in the union
        tool_reply("call_3", "make_file", r#"{"path":"chart.png"}"#),
        text_reply("all written"),
    ]));
    let agent = harness.agent(client, 30);
    let (outcome, events) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.files, vec!["chart.png", "data.csv"]);

    let conversation = harness.store.get("c1").unwrap();
    let last = conversation.messages.last().unwrap();
    assert_eq!(last.generated_files, vec!["chart.png", "data.csv"]);

    // The last files_generated event carries the full union
    let last_files = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ProgressEvent::FilesGenerated { files } => Some(files.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_files, vec!["chart.png", "data.csv"]);
}

#[tokio::test]
async fn test_timeout_retry_opt_in() {
    let harness = harness(vec![Arc::new(FlakyTool {
        attempts: AtomicU32::new(0),
    })]);
    let placeholder = harness.seed_turn("c1", "run the flaky tool");

    let client = Arc::new(MockLLMClient::scripted(vec![
        tool_reply("call_1", "flaky", "{}"),
        text_reply("recovered"),
    ]));
    let agent = harness.agent(client, 30);
    let (outcome, _) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.status, MessageStatus::Completed);
    // The single tool message is the retried success, not the timeout
    let conversation = harness.store.get("c1").unwrap();
    let tool_messages: Vec<_> = conversation
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 1);
    assert!(tool_messages[0].content.contains("ok"));
}

#[tokio::test]
async fn test_provider_failure_fails_placeholder() {
    let harness = harness(vec![]);
    let placeholder = harness.seed_turn("c1", "hello");

    let agent = harness.agent(Arc::new(MockLLMClient::failing()), 30);
    let (outcome, events) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.status, MessageStatus::Failed);
    let conversation = harness.store.get("c1").unwrap();
    let last = conversation.messages.last().unwrap();
    assert_eq!(last.status, MessageStatus::Failed);
    assert!(last.content.contains("mock provider failure"));
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Done { status, .. }) if status == "failed"
    ));
}

#[tokio::test]
async fn test_tool_less_model_runs_plain_chat() {
    let harness = harness(vec![Arc::new(FakeSearchTool)]);
    let placeholder = harness.seed_turn("c1", "hello");

    let client = Arc::new(MockLLMClient::scripted(vec![text_reply("plain answer")]));
    let agent = ReactAgent::new(
        harness.store.clone(),
        harness.registry.clone(),
        Arc::new(MockFactory::without_tools(client.clone())),
        30,
        None,
    );
    let (outcome, _) = run_and_collect(&agent, "c1", &placeholder).await;

    assert_eq!(outcome.status, MessageStatus::Completed);
    assert_eq!(outcome.final_content, "plain answer");
    // The request carried no tool declarations
    assert!(client.requests.lock()[0].tools.is_empty());
}

#[tokio::test]
async fn test_cancellation_finalizes_failed() {
    let harness = harness(vec![Arc::new(FakeSearchTool)]);
    let placeholder = harness.seed_turn("c1", "cancel me");

    let client = Arc::new(MockLLMClient::scripted(vec![text_reply("never sent")]));
    let agent = harness.agent(client, 30);

    let (tx, _rx) = progress_channel();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = agent
        .run_turn("c1", &placeholder, "mock-model", tx, cancel)
        .await;

    assert_eq!(outcome.status, MessageStatus::Failed);
    let conversation = harness.store.get("c1").unwrap();
    assert_eq!(
        conversation.messages.last().unwrap().status,
        MessageStatus::Failed
    );
}
