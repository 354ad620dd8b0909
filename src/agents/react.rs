//! ReAct turn driver.
//!
//! Drives one conversation turn from the user's new message to a finalized
//! assistant message: REASON (model call, streaming text to the progress
//! channel), DISPATCH (tool invocations through the registry), OBSERVE
//! (observations appended to the store and the history), looping until the
//! model stops calling tools or the iteration budget runs out. The driver
//! also owns finalization — the placeholder is always resolved, even when
//! the turn fails or the client has gone away.

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agents::progress::{ProgressEvent, ProgressSender};
use crate::llm::client::{CompletionReply, CompletionRequest, StreamAssembler, ToolChoice};
use crate::llm::provider_registry::LLMClientFactoryTrait;
use crate::llm::LLMClient;
use crate::store::ConversationStore;
use crate::tools::registry::{ToolContext, ToolRegistry};
use crate::types::{
    merge_generated_files, AppError, Message, MessageStatus, Result, ToolCall, ToolFailure,
    ToolOutcome,
};

/// Final state of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// `Completed` or `Failed`.
    pub status: MessageStatus,
    /// Final assistant text (or error text on failure).
    pub final_content: String,
    /// All files generated during the turn, first-seen order.
    pub files: Vec<String>,
}

/// The ReAct orchestrator. One instance per in-flight turn.
pub struct ReactAgent {
    store: Arc<ConversationStore>,
    registry: Arc<ToolRegistry>,
    providers: Arc<dyn LLMClientFactoryTrait>,
    max_iterations: u32,
    system_prompt: Option<String>,
}

impl ReactAgent {
    pub fn new(
        store: Arc<ConversationStore>,
        registry: Arc<ToolRegistry>,
        providers: Arc<dyn LLMClientFactoryTrait>,
        max_iterations: u32,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            store,
            registry,
            providers,
            max_iterations,
            system_prompt,
        }
    }

    /// Drive one turn to completion. Never returns an error: every failure
    /// path finalizes the placeholder and reports through the outcome.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        placeholder_id: &str,
        model_name: &str,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let outcome = self
            .drive(conversation_id, placeholder_id, model_name, &progress, &cancel)
            .await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(conversation_id, error = %e, "Turn failed");
                TurnOutcome {
                    status: MessageStatus::Failed,
                    final_content: e.to_string(),
                    files: Vec::new(),
                }
            }
        };
        self.finalize(conversation_id, placeholder_id, &outcome, &progress)
            .await
    }

    async fn drive(
        &self,
        conversation_id: &str,
        placeholder_id: &str,
        model_name: &str,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let client = self.providers.create_client(model_name)?;
        let supports_tools = self.providers.supports_tools(model_name);
        let model_config = self.providers.model_config(model_name);
        let workdir = self.store.workdir(conversation_id)?;

        let tools = if supports_tools {
            self.registry.definitions()
        } else {
            Vec::new()
        };

        let mut history = self.initial_history(conversation_id, placeholder_id)?;
        let mut files_union: Vec<String> = Vec::new();

        for iteration in 1..=self.max_iterations {
            if cancel.is_cancelled() {
                return Err(AppError::Internal("Turn cancelled".to_string()));
            }
            debug!(conversation_id, iteration, "REASON");

            let request = CompletionRequest {
                model: model_name.to_string(),
                messages: history.clone(),
                tools: tools.clone(),
                tool_choice: if tools.is_empty() {
                    ToolChoice::None
                } else {
                    ToolChoice::Auto
                },
                temperature: model_config.and_then(|m| m.temperature),
                max_tokens: model_config.and_then(|m| m.max_tokens),
            };

            let reply = self.reason(client.as_ref(), &request, progress, cancel).await?;

            if reply.tool_calls.is_empty() {
                return Ok(TurnOutcome {
                    status: MessageStatus::Completed,
                    final_content: reply.content,
                    files: files_union,
                });
            }

            // The assistant message carrying the calls is persisted before
            // any observation so the log always satisfies the
            // tool-references-assistant invariant.
            self.store.append_assistant_tool_calls(
                conversation_id,
                &reply.content,
                reply.tool_calls.clone(),
            )?;
            let mut assistant = Message::assistant_placeholder();
            assistant.content = reply.content.clone();
            assistant.tool_calls = reply.tool_calls.clone();
            assistant.status = MessageStatus::Completed;
            history.push(assistant);

            let outcomes = self
                .dispatch(&reply.tool_calls, conversation_id, &workdir, progress, cancel)
                .await;

            for (call, outcome) in reply.tool_calls.iter().zip(outcomes) {
                let observation = outcome.observation();
                progress
                    .emit(ProgressEvent::ToolCallResult {
                        name: call.name.clone(),
                        status: outcome.status.clone(),
                        files_added: outcome.generated_files.clone(),
                    })
                    .await;
                if !outcome.generated_files.is_empty() {
                    merge_generated_files(&mut files_union, &outcome.generated_files);
                    progress
                        .emit(ProgressEvent::FilesGenerated {
                            files: files_union.clone(),
                        })
                        .await;
                }
                self.store.append_tool_message(
                    conversation_id,
                    &call.id,
                    &call.name,
                    &observation,
                    outcome.generated_files.clone(),
                )?;
                history.push(Message::tool(
                    call.id.clone(),
                    call.name.clone(),
                    observation,
                    outcome.generated_files,
                ));
            }
        }

        // Budget exhausted: ask for a best-effort summary, without tools, and
        // complete the turn with a note.
        warn!(conversation_id, budget = self.max_iterations, "Iteration budget exhausted");
        let summary = self
            .summarize_progress(client.as_ref(), model_name, &history, model_config)
            .await;
        Ok(TurnOutcome {
            status: MessageStatus::Completed,
            final_content: format!(
                "{}\n\n[Iteration budget of {} reached before the task finished.]",
                summary, self.max_iterations
            ),
            files: files_union,
        })
    }

    /// One REASON step: stream the model, pump text deltas, reassemble.
    async fn reason(
        &self,
        client: &dyn LLMClient,
        request: &CompletionRequest,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<CompletionReply> {
        let mut stream = client.stream(request).await?;
        let mut assembler = StreamAssembler::new();
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                _ = cancel.cancelled() => {
                    return Err(AppError::Internal("Turn cancelled".to_string()));
                }
            };
            let Some(event) = event else { break };
            let event = event?;
            if let crate::llm::StreamEvent::TextDelta(text) = &event {
                progress
                    .emit(ProgressEvent::TextDelta { text: text.clone() })
                    .await;
            }
            assembler.ingest(&event);
        }
        assembler.finish()
    }

    /// Dispatch one reply's tool calls. Sequential by default; maximal runs
    /// of `pure` tools run concurrently since they cannot touch the working
    /// directory. Results always come back in call order.
    async fn dispatch(
        &self,
        calls: &[ToolCall],
        conversation_id: &str,
        workdir: &std::path::Path,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Vec<ToolOutcome> {
        let ctx = ToolContext {
            conversation_id: conversation_id.to_string(),
            workdir: workdir.to_path_buf(),
            cancel: cancel.clone(),
        };

        let mut outcomes: Vec<ToolOutcome> = Vec::with_capacity(calls.len());
        let mut i = 0;
        while i < calls.len() {
            let pure_run_end = calls[i..]
                .iter()
                .take_while(|c| self.registry.is_pure(&c.name))
                .count()
                + i;
            if pure_run_end - i >= 2 {
                for call in &calls[i..pure_run_end] {
                    progress
                        .emit(ProgressEvent::ToolCallStarted {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        })
                        .await;
                }
                let batch = futures::future::join_all(
                    calls[i..pure_run_end]
                        .iter()
                        .map(|call| self.invoke_with_retry(call, &ctx)),
                )
                .await;
                outcomes.extend(batch);
                i = pure_run_end;
            } else {
                let call = &calls[i];
                progress
                    .emit(ProgressEvent::ToolCallStarted {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .await;
                outcomes.push(self.invoke_with_retry(call, &ctx).await);
                i += 1;
            }
        }
        outcomes
    }

    /// Invoke a tool; a timed-out call is retried once with the same
    /// arguments when its descriptor opted in. All other failures go back to
    /// the model as observations.
    async fn invoke_with_retry(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutcome {
        let outcome = self.registry.invoke(&call.name, &call.arguments, ctx).await;
        if outcome.failure == Some(ToolFailure::Timeout)
            && self.registry.retries_on_timeout(&call.name)
        {
            info!(tool = %call.name, "Retrying timed-out tool once");
            return self.registry.invoke(&call.name, &call.arguments, ctx).await;
        }
        outcome
    }

    async fn summarize_progress(
        &self,
        client: &dyn LLMClient,
        model_name: &str,
        history: &[Message],
        model_config: Option<&crate::utils::config::ModelConfig>,
    ) -> String {
        let mut messages = history.to_vec();
        messages.push(Message::user(
            "The tool budget for this task is exhausted. Summarize what was \
             accomplished so far and what remains, in a short final answer.",
            "",
        ));
        let request = CompletionRequest {
            model: model_name.to_string(),
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            temperature: model_config.and_then(|m| m.temperature),
            max_tokens: model_config.and_then(|m| m.max_tokens),
        };
        match client.complete(&request).await {
            Ok(reply) => reply.content,
            Err(e) => {
                warn!(error = %e, "Best-effort summary failed");
                "The iteration budget was exhausted before the task finished.".to_string()
            }
        }
    }

    /// History for the model: the optional system prompt plus all completed
    /// messages. The placeholder itself and failed turns stay out of the
    /// context.
    fn initial_history(&self, conversation_id: &str, placeholder_id: &str) -> Result<Vec<Message>> {
        let conversation = self.store.get(conversation_id)?;
        let mut history = Vec::with_capacity(conversation.messages.len() + 1);
        if let Some(system_prompt) = &self.system_prompt {
            history.push(Message::system(system_prompt.clone()));
        }
        history.extend(
            conversation
                .messages
                .into_iter()
                .filter(|m| m.server_msg_id != placeholder_id)
                .filter(|m| m.status == MessageStatus::Completed),
        );
        Ok(history)
    }

    /// Resolve the placeholder, run neighbor normalization, and emit `Done`.
    /// Runs unconditionally, also for failed turns.
    async fn finalize(
        &self,
        conversation_id: &str,
        placeholder_id: &str,
        outcome: &TurnOutcome,
        progress: &ProgressSender,
    ) -> TurnOutcome {
        let mut files = outcome.files.clone();
        if let Err(e) = self.store.update_assistant(
            conversation_id,
            placeholder_id,
            &outcome.final_content,
            Vec::new(),
            files.clone(),
            outcome.status,
        ) {
            error!(conversation_id, error = %e, "Failed to finalize placeholder");
        }
        if let Err(e) = self.store.neighbor_normalize(conversation_id) {
            warn!(conversation_id, error = %e, "neighbor_normalize failed");
        }
        if let Ok(conversation) = self.store.get(conversation_id) {
            if let Some(message) = conversation
                .messages
                .iter()
                .find(|m| m.server_msg_id == placeholder_id)
            {
                files = message.generated_files.clone();
            }
        }
        let result = TurnOutcome {
            status: outcome.status,
            final_content: outcome.final_content.clone(),
            files: files.clone(),
        };
        progress
            .emit(ProgressEvent::Done {
                status: match outcome.status {
                    MessageStatus::Failed => "failed".to_string(),
                    _ => "completed".to_string(),
                },
                final_content: result.final_content.clone(),
                files,
            })
            .await;
        result
    }
}
