//! Bounded tool-calling agent loop.
//!
//! The loop is structurally finite: `max_turns` caps model-call rounds and
//! `max_steps` caps the total of model calls plus tool executions. Exceeding
//! either bound is an error, never a silent truncation, so callers can report
//! a budget-exceeded outcome instead of looping indefinitely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::validator_for;
use serde_json::{json, Value};
use thiserror::Error;

use smith_ai::{AiError, ChatRequest, LlmClient, Message, ToolDefinition};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: String,
    /// Round budget: maximum model-call rounds before forced termination.
    pub max_turns: usize,
    /// Step budget: maximum model calls + tool executions combined.
    pub max_steps: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_timeout_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful coding assistant.".to_string(),
            max_turns: 20,
            max_steps: 50,
            temperature: Some(0.1),
            max_tokens: None,
            tool_timeout_ms: Some(120_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }

    /// Converts the payload to text for insertion into a tool message.
    pub fn as_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

#[async_trait]
pub trait AgentTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Ai(#[from] AiError),
    #[error("agent exceeded max turns ({0})")]
    MaxTurnsExceeded(usize),
    #[error("agent exceeded max steps ({0})")]
    MaxStepsExceeded(usize),
}

impl AgentError {
    /// True for the budget-bound terminations, as opposed to provider errors.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(
            self,
            AgentError::MaxTurnsExceeded(_) | AgentError::MaxStepsExceeded(_)
        )
    }
}

pub struct Agent {
    client: Arc<dyn LlmClient>,
    config: AgentConfig,
    tools: HashMap<String, (ToolDefinition, Arc<dyn AgentTool>)>,
    tool_order: Vec<String>,
    messages: Vec<Message>,
}

impl Agent {
    pub fn new(client: Arc<dyn LlmClient>, config: AgentConfig) -> Self {
        let messages = vec![Message::system(config.system_prompt.clone())];
        Self {
            client,
            config,
            tools: HashMap::new(),
            tool_order: Vec::new(),
            messages,
        }
    }

    pub fn register_tool<T>(&mut self, tool: T)
    where
        T: AgentTool + 'static,
    {
        self.register_tool_arc(Arc::new(tool));
    }

    pub fn register_tool_arc(&mut self, tool: Arc<dyn AgentTool>) {
        let definition = tool.definition();
        let name = definition.name.clone();
        if !self.tools.contains_key(&name) {
            self.tool_order.push(name.clone());
        }
        self.tools.insert(name, (definition, tool));
    }

    /// Replaces the conversation with a previously recorded session, keeping
    /// the configured system prompt at the head.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        self.messages = vec![Message::system(self.config.system_prompt.clone())];
        self.messages.extend(
            history
                .into_iter()
                .filter(|message| message.role != smith_ai::MessageRole::System),
        );
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tool_order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|(definition, _)| definition.clone()))
            .collect()
    }

    /// Runs the loop until the model finishes without tool calls or a budget
    /// is exhausted. Returns the messages appended during this run, in order;
    /// this is the tool-invocation trace callers derive outcomes from.
    pub async fn run_task(&mut self, text: impl Into<String>) -> Result<Vec<Message>, AgentError> {
        let start_index = self.messages.len();
        self.messages.push(Message::user(text.into()));
        let mut steps_used = 0usize;

        for turn in 1..=self.config.max_turns {
            if steps_used >= self.config.max_steps {
                return Err(AgentError::MaxStepsExceeded(self.config.max_steps));
            }
            steps_used += 1;

            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: self.messages.clone(),
                tools: self.tool_definitions(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };
            let response = self.client.complete(request).await?;
            let assistant = response.message;
            self.messages.push(assistant.clone());

            let tool_calls = assistant.tool_calls();
            if tool_calls.is_empty() {
                return Ok(self.messages[start_index..].to_vec());
            }

            tracing::debug!(turn, tool_calls = tool_calls.len(), "executing tool calls");
            for call in tool_calls {
                if steps_used >= self.config.max_steps {
                    return Err(AgentError::MaxStepsExceeded(self.config.max_steps));
                }
                steps_used += 1;

                let result = self.execute_tool_call(&call).await;
                if result.is_error {
                    tracing::debug!(tool = %call.name, error = %result.as_text(), "tool call failed");
                }
                self.messages.push(Message::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    result.as_text(),
                    result.is_error,
                ));
            }
        }

        Err(AgentError::MaxTurnsExceeded(self.config.max_turns))
    }

    async fn execute_tool_call(&self, call: &smith_ai::ToolCall) -> ToolExecutionResult {
        let Some((definition, tool)) = self.tools.get(&call.name) else {
            return ToolExecutionResult::error(json!({
                "error": format!("tool '{}' is not registered", call.name)
            }));
        };

        if let Err(error) = validate_tool_arguments(definition, &call.arguments) {
            return ToolExecutionResult::error(json!({ "error": error }));
        }

        let timeout = self
            .config
            .tool_timeout_ms
            .filter(|timeout_ms| *timeout_ms > 0)
            .map(Duration::from_millis);
        let arguments = call.arguments.clone();
        if let Some(timeout) = timeout {
            match tokio::time::timeout(timeout, tool.execute(arguments)).await {
                Ok(result) => result,
                Err(_) => ToolExecutionResult::error(json!({
                    "error": format!(
                        "tool '{}' timed out after {}ms",
                        call.name,
                        timeout.as_millis()
                    )
                })),
            }
        } else {
            tool.execute(arguments).await
        }
    }
}

/// Validates tool-call arguments before dispatch. A string payload means the
/// provider could not parse the model's argument JSON; the diagnostic names
/// the most common cause (unescaped control characters) so the model can
/// re-emit corrected input.
pub fn validate_tool_arguments(definition: &ToolDefinition, arguments: &Value) -> Result<(), String> {
    if let Value::String(raw) = arguments {
        if serde_json::from_str::<Value>(raw).is_err() {
            return Err(format!(
                "arguments for tool '{}' were not valid JSON; control characters inside string \
                 values must be escaped (for example a literal newline must be written as \\n). \
                 Re-emit the call with properly escaped JSON.",
                definition.name
            ));
        }
    }

    let validator = match validator_for(&definition.parameters) {
        Ok(validator) => validator,
        Err(error) => return Err(format!("invalid tool parameter schema: {error}")),
    };
    let candidate = match arguments {
        Value::String(raw) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
        other => other.clone(),
    };
    let mut errors = validator.iter_errors(&candidate);
    if let Some(first) = errors.next() {
        return Err(format!(
            "arguments for tool '{}' failed validation: {first}",
            definition.name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        validate_tool_arguments, Agent, AgentConfig, AgentError, AgentTool, ToolExecutionResult,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use smith_ai::{
        AiError, ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message,
        MessageRole, ToolDefinition,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait]
    impl AgentTool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".to_string(),
                description: "Echoes a message".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "message": { "type": "string" } },
                    "required": ["message"],
                    "additionalProperties": false
                }),
            }
        }

        async fn execute(&self, arguments: Value) -> ToolExecutionResult {
            ToolExecutionResult::ok(arguments)
        }
    }

    /// Always requests one more echo call; never finishes on its own.
    struct LoopingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for LoopingClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, AiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                message: Message::assistant_blocks(vec![ContentBlock::ToolCall {
                    id: format!("call_{call}"),
                    name: "echo".to_string(),
                    arguments: json!({ "message": "again" }),
                }]),
                finish_reason: Some("tool_calls".to_string()),
                usage: ChatUsage::default(),
            })
        }
    }

    struct FinishClient;

    #[async_trait]
    impl LlmClient for FinishClient {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, AiError> {
            Ok(ChatResponse {
                message: Message::assistant_text("all done"),
                finish_reason: Some("stop".to_string()),
                usage: ChatUsage::default(),
            })
        }
    }

    fn echo_definition() -> ToolDefinition {
        EchoTool.definition()
    }

    #[test]
    fn unit_validate_tool_arguments_accepts_valid_object() {
        let result = validate_tool_arguments(&echo_definition(), &json!({ "message": "hi" }));
        assert!(result.is_ok());
    }

    #[test]
    fn unit_validate_tool_arguments_rejects_missing_field() {
        let error = validate_tool_arguments(&echo_definition(), &json!({})).unwrap_err();
        assert!(error.contains("failed validation"));
    }

    #[test]
    fn unit_validate_tool_arguments_reports_unescaped_control_characters() {
        let raw = Value::String("{\"message\":\"line1\nline2\"}".to_string());
        let error = validate_tool_arguments(&echo_definition(), &raw).unwrap_err();
        assert!(error.contains("escaped"));
        assert!(error.contains("\\n"));
    }

    #[tokio::test]
    async fn functional_run_task_returns_trace_on_completion() {
        let mut agent = Agent::new(Arc::new(FinishClient), AgentConfig::default());
        let trace = agent.run_task("do nothing").await.unwrap();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].role, MessageRole::User);
        assert_eq!(trace[1].text_content(), "all done");
    }

    #[tokio::test]
    async fn functional_run_task_terminates_at_exact_round_budget() {
        let client = Arc::new(LoopingClient {
            calls: AtomicUsize::new(0),
        });
        let mut agent = Agent::new(
            client.clone(),
            AgentConfig {
                max_turns: 3,
                max_steps: 100,
                ..AgentConfig::default()
            },
        );
        agent.register_tool(EchoTool);

        let error = agent.run_task("loop forever").await.unwrap_err();
        match error {
            AgentError::MaxTurnsExceeded(3) => {}
            other => panic!("expected MaxTurnsExceeded(3), got {other:?}"),
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn functional_run_task_enforces_step_budget() {
        let client = Arc::new(LoopingClient {
            calls: AtomicUsize::new(0),
        });
        let mut agent = Agent::new(
            client,
            AgentConfig {
                max_turns: 100,
                max_steps: 4,
                ..AgentConfig::default()
            },
        );
        agent.register_tool(EchoTool);

        let error = agent.run_task("loop forever").await.unwrap_err();
        assert!(matches!(error, AgentError::MaxStepsExceeded(4)));
        assert!(error.is_budget_exhausted());
    }

    #[tokio::test]
    async fn regression_unregistered_tool_yields_error_result_not_panic() {
        struct WrongToolClient {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl LlmClient for WrongToolClient {
            async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, AiError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(ChatResponse {
                        message: Message::assistant_blocks(vec![ContentBlock::ToolCall {
                            id: "call_0".to_string(),
                            name: "missing".to_string(),
                            arguments: json!({}),
                        }]),
                        finish_reason: Some("tool_calls".to_string()),
                        usage: ChatUsage::default(),
                    })
                } else {
                    let last = request.messages.last().unwrap();
                    assert!(last.is_error);
                    Ok(ChatResponse {
                        message: Message::assistant_text("recovered"),
                        finish_reason: Some("stop".to_string()),
                        usage: ChatUsage::default(),
                    })
                }
            }
        }

        let mut agent = Agent::new(
            Arc::new(WrongToolClient {
                calls: AtomicUsize::new(0),
            }),
            AgentConfig::default(),
        );
        let trace = agent.run_task("call something").await.unwrap();
        let tool_message = trace
            .iter()
            .find(|message| message.role == MessageRole::Tool)
            .unwrap();
        assert!(tool_message.is_error);
        assert!(tool_message.text_content().contains("not registered"));
    }
}
