//! Task Execution Engine: one issue in, one structured outcome out.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

use smith_agent::{Agent, AgentConfig, AgentError, AgentTool};
use smith_ai::{LlmClient, Message, MessageRole};
use smith_github::{branch_name_for_issue, GithubClient, Issue};

use crate::prompts;
use crate::session::SessionStore;
use crate::tools::{
    CreateFilesTool, DeleteFileTool, EditFileTool, ListDirectoryTool, ReadFileTool, ToolContext,
    MUTATING_TOOL_NAMES,
};

/// One processing attempt for one issue. The branch name is a pure function
/// of the issue number, so re-processing converges on the same branch.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub issue: Issue,
    pub additional_context: Option<String>,
    pub branch_name: String,
    pub thread_id: String,
}

impl ProcessingTask {
    pub fn for_issue(issue: Issue) -> Self {
        let branch_name = branch_name_for_issue(issue.number);
        let thread_id = issue.number.to_string();
        Self {
            issue,
            additional_context: None,
            branch_name,
            thread_id,
        }
    }

    pub fn with_additional_context(mut self, context: String) -> Self {
        self.additional_context = Some(context);
        self
    }

    /// Follow-up runs reuse the existing PR's head branch even if it predates
    /// the current naming scheme.
    pub fn with_branch(mut self, branch_name: String) -> Self {
        self.branch_name = branch_name;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcomeKind {
    Success,
    NoChangesProduced,
    BudgetExceeded,
    ToolExecutionFailed { tool_name: String, error: String },
}

#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub kind: TaskOutcomeKind,
    /// Paths touched by successful mutating tool calls, in first-touch order.
    /// Derived from the tool trace, never from the model's closing prose.
    pub files_changed: Vec<String>,
    pub summary_text: String,
}

impl ProcessingOutcome {
    pub fn is_success(&self) -> bool {
        self.kind == TaskOutcomeKind::Success
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    /// Round budget: model-call rounds per run.
    pub max_turns: usize,
    /// Step budget: model calls plus tool executions per run.
    pub max_steps: usize,
    pub tool_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_turns: 20,
            max_steps: 50,
            tool_timeout_ms: Some(120_000),
        }
    }
}

pub struct TaskExecutionEngine {
    client: Arc<dyn LlmClient>,
    config: EngineConfig,
    extension_tools: Vec<Arc<dyn AgentTool>>,
}

impl TaskExecutionEngine {
    pub fn new(client: Arc<dyn LlmClient>, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            extension_tools: Vec::new(),
        }
    }

    /// Adds an externally supplied tool to every subsequent run's tool set.
    pub fn register_extension_tool(&mut self, tool: Arc<dyn AgentTool>) {
        self.extension_tools.push(tool);
    }

    /// Runs the reasoning engine for one task under the round and step
    /// budgets. Transient provider failures propagate as errors so the
    /// caller can skip the issue for this cycle; budget exhaustion is a
    /// reportable outcome, not an error.
    pub async fn execute(
        &self,
        gateway: &GithubClient,
        task: &ProcessingTask,
        sessions: &mut SessionStore,
    ) -> Result<ProcessingOutcome> {
        let agent_config = AgentConfig {
            model: self.config.model.clone(),
            system_prompt: prompts::system_prompt(&gateway.repo().as_slug()),
            max_turns: self.config.max_turns,
            max_steps: self.config.max_steps,
            tool_timeout_ms: self.config.tool_timeout_ms,
            ..AgentConfig::default()
        };
        let mut agent = Agent::new(Arc::clone(&self.client), agent_config);
        agent.replace_history(sessions.history(&task.thread_id));

        let context = Arc::new(ToolContext {
            client: gateway.clone(),
            branch: task.branch_name.clone(),
            issue_number: task.issue.number,
        });
        agent.register_tool(CreateFilesTool::new(Arc::clone(&context)));
        agent.register_tool(ReadFileTool::new(Arc::clone(&context)));
        agent.register_tool(ListDirectoryTool::new(Arc::clone(&context)));
        agent.register_tool(EditFileTool::new(Arc::clone(&context)));
        agent.register_tool(DeleteFileTool::new(Arc::clone(&context)));
        for tool in &self.extension_tools {
            agent.register_tool_arc(Arc::clone(tool));
        }

        let prompt = prompts::task_prompt(&task.issue, task.additional_context.as_deref());
        tracing::info!(
            issue = task.issue.number,
            branch = %task.branch_name,
            follow_up = task.additional_context.is_some(),
            "executing task"
        );

        match agent.run_task(prompt).await {
            Ok(trace) => {
                sessions.append(&task.thread_id, trace.iter().cloned());
                Ok(outcome_from_trace(&trace))
            }
            Err(error) if error.is_budget_exhausted() => {
                tracing::warn!(issue = task.issue.number, %error, "run exhausted its budget");
                Ok(ProcessingOutcome {
                    kind: TaskOutcomeKind::BudgetExceeded,
                    files_changed: Vec::new(),
                    summary_text: error.to_string(),
                })
            }
            Err(AgentError::Ai(error)) => {
                Err(error).context("reasoning engine call failed")
            }
            Err(error) => Err(error).context("agent run failed"),
        }
    }
}

/// Walks one run's trace and derives the outcome. `files_changed` comes only
/// from successful mutating tool results; a final message claiming success
/// cannot override a failed or absent mutation.
fn outcome_from_trace(trace: &[Message]) -> ProcessingOutcome {
    let files_changed = files_changed_from_trace(trace);
    let summary_text = trace
        .iter()
        .rev()
        .find(|message| message.role == MessageRole::Assistant)
        .map(Message::text_content)
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| "(no summary provided)".to_string());

    let kind = if !files_changed.is_empty() {
        TaskOutcomeKind::Success
    } else if let Some((tool_name, error)) = first_failed_mutating_call(trace) {
        TaskOutcomeKind::ToolExecutionFailed { tool_name, error }
    } else {
        TaskOutcomeKind::NoChangesProduced
    };
    ProcessingOutcome {
        kind,
        files_changed,
        summary_text,
    }
}

fn files_changed_from_trace(trace: &[Message]) -> Vec<String> {
    let mut files = Vec::new();
    for message in trace {
        if message.role != MessageRole::Tool || message.is_error {
            continue;
        }
        let Some(tool_name) = message.tool_name.as_deref() else {
            continue;
        };
        if !MUTATING_TOOL_NAMES.contains(&tool_name) {
            continue;
        }
        let Ok(payload) = serde_json::from_str::<Value>(&message.text_content()) else {
            continue;
        };
        for path in paths_from_tool_payload(&payload) {
            if !files.contains(&path) {
                files.push(path);
            }
        }
    }
    files
}

fn paths_from_tool_payload(payload: &Value) -> Vec<String> {
    if let Some(entries) = payload.get("files").and_then(Value::as_array) {
        return entries
            .iter()
            .filter_map(|entry| entry.get("path").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
    }
    payload
        .get("path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .into_iter()
        .collect()
}

fn first_failed_mutating_call(trace: &[Message]) -> Option<(String, String)> {
    trace.iter().find_map(|message| {
        if message.role != MessageRole::Tool || !message.is_error {
            return None;
        }
        let tool_name = message.tool_name.as_deref()?;
        if !MUTATING_TOOL_NAMES.contains(&tool_name) {
            return None;
        }
        Some((tool_name.to_string(), message.text_content()))
    })
}
