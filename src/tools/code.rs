//! Code and shell execution tools, fronting the sandbox executor.
//!
//! Both tools run inside the conversation's working directory. The sandbox
//! deadline is set slightly below the descriptor deadline so the subprocess
//! is signaled, its partial output collected, and the change set computed
//! before the registry's own timeout would discard everything.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::sandbox::{ExecError, ExecResult, SandboxExecutor};
use crate::tools::registry::{Tool, ToolContext};
use crate::types::{AppError, Result};

/// Headroom between the sandbox deadline and the descriptor deadline.
const SANDBOX_MARGIN: Duration = Duration::from_secs(5);

/// Tail of stderr included in failure observations.
const STDERR_TAIL: usize = 2000;

fn stderr_tail(stderr: &str) -> &str {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    let mut cut = start;
    while !stderr.is_char_boundary(cut) {
        cut += 1;
    }
    &stderr[cut..]
}

fn result_data(result: &ExecResult) -> Value {
    json!({
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
        "duration_ms": result.duration.as_millis() as u64,
        "generated_files": result.changed_files,
    })
}

/// Classify an execution result into an observation the model can act on.
fn map_result(result: ExecResult) -> Result<Value> {
    if result.timed_out {
        return Err(AppError::Sandbox(format!(
            "Execution timed out. Partial stdout: {} Partial stderr: {}",
            result.stdout,
            stderr_tail(&result.stderr)
        )));
    }
    if result.exit_code != 0 {
        return Err(AppError::Sandbox(format!(
            "Process exited with code {}: {}",
            result.exit_code,
            stderr_tail(&result.stderr)
        )));
    }
    Ok(result_data(&result))
}

fn map_exec_error(error: ExecError) -> AppError {
    AppError::Sandbox(error.to_string())
}

/// Python execution tool.
pub struct ExecuteCodeTool {
    executor: SandboxExecutor,
}

impl ExecuteCodeTool {
    pub fn new(executor: SandboxExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn description(&self) -> &str {
        "Run Python code in the conversation workspace. Files written to the \
         current directory are attached to the conversation. Use \
         register_output(path) for files the runtime cannot detect."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": {
                    "type": "string",
                    "description": "Python source code to execute"
                }
            },
            "required": ["source"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["source"]
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let source = args
            .get("source")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'source' parameter".to_string()))?;
        let deadline = self.timeout().saturating_sub(SANDBOX_MARGIN);
        let result = self
            .executor
            .execute_code(source, &ctx.workdir, &ctx.conversation_id, deadline, &ctx.cancel)
            .await
            .map_err(map_exec_error)?;
        map_result(result)
    }
}

/// Shell execution tool.
pub struct ExecuteShellTool {
    executor: SandboxExecutor,
}

impl ExecuteShellTool {
    pub fn new(executor: SandboxExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ExecuteShellTool {
    fn name(&self) -> &str {
        "execute_shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the conversation workspace. Destructive and \
         privileged commands are refused."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command line to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["command"]
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'command' parameter".to_string()))?;
        let deadline = self.timeout().saturating_sub(SANDBOX_MARGIN);
        let result = self
            .executor
            .execute_shell(command, &ctx.workdir, deadline, &ctx.cancel)
            .await
            .map_err(map_exec_error)?;
        map_result(result)
    }
}
