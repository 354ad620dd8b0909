//! Task planning tool.
//!
//! The plan is a structured artifact persisted as `plan.json` in the
//! conversation's working directory — the source of truth across turns, not
//! conversation-local state. The tool both reads and writes it: `create`
//! replaces the plan, `update` advances one step, `get` returns the current
//! state with derived progress counters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::tools::registry::{Tool, ToolContext};
use crate::types::{AppError, Result};

const PLAN_FILE: &str = "plan.json";

/// Status of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One step of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based step number.
    pub step: u32,
    /// What this step does.
    pub action: String,
    /// Current status.
    pub status: StepStatus,
    /// Outcome note, set when the step finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// The persisted plan artifact.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    /// Overall task being planned.
    pub task_description: String,
    /// Ordered steps.
    pub steps: Vec<PlanStep>,
}

impl Plan {
    fn counters(&self) -> Value {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        json!({
            "total": self.steps.len(),
            "pending": count(StepStatus::Pending),
            "in_progress": count(StepStatus::InProgress),
            "completed": count(StepStatus::Completed),
            "failed": count(StepStatus::Failed),
        })
    }

    fn to_response(&self) -> Value {
        json!({
            "task_description": self.task_description,
            "steps": self.steps,
            "progress": self.counters(),
        })
    }
}

/// Plan management tool.
pub struct PlanTool;

#[async_trait]
impl Tool for PlanTool {
    fn name(&self) -> &str {
        "plan"
    }

    fn description(&self) -> &str {
        "Create, inspect, or update the task plan for this conversation. \
         Actions: 'create' (task_description + steps), 'update' (step + \
         status, optional result), 'get'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "description": "One of: create, update, get",
                    "enum": ["create", "update", "get"]
                },
                "task_description": {
                    "type": "string",
                    "description": "The overall task (create only)"
                },
                "steps": {
                    "type": "array",
                    "description": "Step descriptions in order (create only)",
                    "items": {"type": "string"}
                },
                "step": {
                    "type": "integer",
                    "description": "1-based step number (update only)"
                },
                "status": {
                    "type": "string",
                    "description": "New step status (update only)",
                    "enum": ["pending", "in_progress", "completed", "failed"]
                },
                "result": {
                    "type": "string",
                    "description": "Outcome note for the step (update only)"
                }
            },
            "required": ["action"]
        })
    }

    fn required_params(&self) -> &[&str] {
        &["action"]
    }

    async fn execute(&self, args: Map<String, Value>, ctx: &ToolContext) -> Result<Value> {
        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::InvalidInput("Missing 'action' parameter".to_string()))?;
        let path = ctx.workdir.join(PLAN_FILE);

        match action {
            "create" => {
                let task_description = args
                    .get("task_description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let steps: Vec<PlanStep> = args
                    .get("steps")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| v.as_str())
                            .enumerate()
                            .map(|(i, action)| PlanStep {
                                step: i as u32 + 1,
                                action: action.to_string(),
                                status: StepStatus::Pending,
                                result: None,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let plan = Plan {
                    task_description,
                    steps,
                };
                save_plan(&path, &plan).await?;
                Ok(plan.to_response())
            }
            "update" => {
                let mut plan = load_plan(&path).await?.ok_or_else(|| {
                    AppError::InvalidInput("No plan exists yet; call 'create' first".to_string())
                })?;
                let step_no = args
                    .get("step")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| AppError::InvalidInput("Missing 'step' parameter".to_string()))?
                    as u32;
                let status = args
                    .get("status")
                    .and_then(|v| v.as_str())
                    .map(parse_status)
                    .transpose()?
                    .ok_or_else(|| {
                        AppError::InvalidInput("Missing 'status' parameter".to_string())
                    })?;
                let step = plan
                    .steps
                    .iter_mut()
                    .find(|s| s.step == step_no)
                    .ok_or_else(|| {
                        AppError::InvalidInput(format!("No step {} in the plan", step_no))
                    })?;
                step.status = status;
                if let Some(result) = args.get("result").and_then(|v| v.as_str()) {
                    step.result = Some(result.to_string());
                }
                save_plan(&path, &plan).await?;
                Ok(plan.to_response())
            }
            "get" => match load_plan(&path).await? {
                Some(plan) => Ok(plan.to_response()),
                None => Ok(json!({"task_description": null, "steps": [], "progress": null})),
            },
            other => Err(AppError::InvalidInput(format!(
                "Unknown plan action: {}",
                other
            ))),
        }
    }
}

fn parse_status(raw: &str) -> Result<StepStatus> {
    match raw {
        "pending" => Ok(StepStatus::Pending),
        "in_progress" => Ok(StepStatus::InProgress),
        "completed" => Ok(StepStatus::Completed),
        "failed" => Ok(StepStatus::Failed),
        other => Err(AppError::InvalidInput(format!(
            "Unknown step status: {}",
            other
        ))),
    }
}

async fn load_plan(path: &std::path::Path) -> Result<Option<Plan>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| AppError::Internal(format!("Corrupt plan.json: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AppError::Internal(format!("Cannot read plan.json: {}", e))),
    }
}

async fn save_plan(path: &std::path::Path, plan: &Plan) -> Result<()> {
    let raw = serde_json::to_string_pretty(plan)
        .map_err(|e| AppError::Internal(format!("Cannot serialize plan: {}", e)))?;
    tokio::fs::write(path, raw)
        .await
        .map_err(|e| AppError::Internal(format!("Cannot write plan.json: {}", e)))
}
