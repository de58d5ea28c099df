//! Handler session: one conversation with one LLM
//!
//! The session is the only owner of its conversation history. Per turn it
//! checks the meter, calls the provider, executes direct tools inline,
//! and hands subtask tool calls back to the caller as CONTINUATION. The
//! state machine is READY → CALLING_LLM → {COMPLETE, CONTINUATION_PENDING,
//! FAILED}; a pending continuation is resumed with add_tool_response
//! followed by another execute_prompt.

use crate::meter::ResourceMeter;
use std::sync::Arc;
use taskloom_core::{FailureReason, ResourceKind, SubtaskRequest, TaskError, TaskResult};
use taskloom_llm::{
    ContentBlock, LlmContent, LlmError, LlmMessage, LlmProvider, LlmRequest, ToolInvocation,
};
use taskloom_tools::{ToolOutcome, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    CallingLlm,
    Complete,
    ContinuationPending,
    Failed,
}

pub struct Session {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    model: String,
    base_prompt: String,
    template_system: Option<String>,
    context_block: Option<String>,
    history: Vec<LlmMessage>,
    meter: ResourceMeter,
    state: SessionState,
    pending_tool: Option<ToolInvocation>,
    resume_pending: bool,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        model: impl Into<String>,
        base_prompt: impl Into<String>,
        meter: ResourceMeter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            tools,
            model: model.into(),
            base_prompt: base_prompt.into(),
            template_system: None,
            context_block: None,
            history: Vec::new(),
            meter,
            state: SessionState::Ready,
            pending_tool: None,
            resume_pending: false,
            cancel,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[LlmMessage] {
        &self.history
    }

    pub fn meter(&self) -> &ResourceMeter {
        &self.meter
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Name of the tool call awaiting a response, if any.
    pub fn pending_tool_name(&self) -> Option<&str> {
        self.pending_tool.as_ref().map(|t| t.name.as_str())
    }

    pub fn set_template_system(&mut self, system: Option<String>) {
        self.template_system = system;
    }

    /// Install the resolved data context for this session.
    pub fn prime_data_context(&mut self, context_block: Option<String>) {
        self.context_block = context_block.filter(|block| !block.is_empty());
    }

    /// Clear history and pending state; the meter keeps its counts.
    pub fn reset(&mut self) {
        self.history.clear();
        self.pending_tool = None;
        self.resume_pending = false;
        self.state = SessionState::Ready;
    }

    /// System prompt assembly, fixed order: base prompt, template system
    /// text, context block, tool directives.
    fn system_prompt(&self) -> String {
        let mut parts = vec![self.base_prompt.clone()];
        if let Some(system) = &self.template_system {
            parts.push(system.clone());
        }
        if let Some(context) = &self.context_block {
            parts.push(format!("Context:\n{}", context));
        }
        let tool_prompts = self.tools.combined_prompts();
        if !tool_prompts.is_empty() {
            parts.push(tool_prompts);
        }
        parts.retain(|p| !p.is_empty());
        parts.join("\n\n")
    }

    fn estimated_prompt_tokens(&self, system: &str) -> u64 {
        let history_tokens: u64 = self
            .history
            .iter()
            .map(|m| ResourceMeter::estimate_tokens(&m.text()) + 10)
            .sum();
        ResourceMeter::estimate_tokens(system) + history_tokens
    }

    /// Fold the pending subtask's result back into the conversation. At
    /// most one response per pending tool call; the tool name must match
    /// the call that produced the continuation.
    pub fn add_tool_response(&mut self, tool_name: &str, content: &str) -> Result<(), TaskError> {
        if self.state != SessionState::ContinuationPending {
            return Err(TaskError::failure(
                FailureReason::UnexpectedError,
                "no continuation is pending on this session",
            ));
        }
        let pending = self.pending_tool.take().ok_or_else(|| {
            TaskError::failure(
                FailureReason::UnexpectedError,
                "continuation pending but no tool call recorded",
            )
        })?;
        if pending.name != tool_name {
            self.pending_tool = Some(pending.clone());
            return Err(TaskError::failure(
                FailureReason::UnexpectedError,
                format!(
                    "tool response for '{}' does not match pending call '{}'",
                    tool_name, pending.name
                ),
            ));
        }

        self.push_tool_result(ContentBlock::ToolResult {
            tool_use_id: pending.id,
            content: content.to_string(),
            is_error: None,
        });
        self.state = SessionState::Ready;
        self.resume_pending = true;
        Ok(())
    }

    /// All tool results for one assistant turn share a single user
    /// message.
    fn push_tool_result(&mut self, block: ContentBlock) {
        if let Some(last) = self.history.last_mut() {
            if last.role == "user" {
                if let LlmContent::Blocks(blocks) = &mut last.content {
                    if blocks
                        .iter()
                        .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
                    {
                        blocks.push(block);
                        return;
                    }
                }
            }
        }
        self.history.push(LlmMessage::tool_results(vec![block]));
    }

    /// Run one prompt turn to a terminal result or a continuation.
    pub async fn execute_prompt(&mut self, prompt: &str) -> TaskResult {
        match self.state {
            SessionState::Ready => {}
            SessionState::ContinuationPending => {
                return TaskResult::failed(TaskError::failure(
                    FailureReason::UnexpectedError,
                    "session has a pending tool call; add_tool_response first",
                ))
            }
            _ => {
                return TaskResult::failed(TaskError::failure(
                    FailureReason::UnexpectedError,
                    format!("session is terminal ({:?})", self.state),
                ))
            }
        }

        // Resuming after add_tool_response: the tool-result message is the
        // user turn, no additional prompt message is pushed.
        if self.resume_pending {
            self.resume_pending = false;
        } else {
            self.history.push(LlmMessage::user(prompt));
        }

        let mut collected = String::new();

        loop {
            if self.cancel.is_cancelled() {
                self.state = SessionState::Failed;
                return TaskResult::failed_with_content(
                    collected,
                    TaskError::failure(FailureReason::ExecutionHalted, "cancelled"),
                );
            }

            // Meter checks happen before the provider is reached.
            if let Err(error) = self.meter.check_turn() {
                self.state = SessionState::Failed;
                return TaskResult::failed_with_content(collected, error);
            }
            let system = self.system_prompt();
            let estimated = self.estimated_prompt_tokens(&system);
            if let Err(error) = self.meter.check_prompt(estimated) {
                self.state = SessionState::Failed;
                return TaskResult::failed_with_content(collected, error);
            }

            self.state = SessionState::CallingLlm;
            let request = LlmRequest {
                model: self.model.clone(),
                messages: self.history.clone(),
                tools: Some(self.tools.definitions()),
                max_tokens: Some(8192),
                temperature: None,
                system: Some(system),
            };

            let response = match self
                .provider
                .complete(request, Some(self.cancel.clone()))
                .await
            {
                Ok(response) => response,
                Err(LlmError::Cancelled) => {
                    self.state = SessionState::Failed;
                    return TaskResult::failed_with_content(
                        collected,
                        TaskError::failure(FailureReason::ExecutionHalted, "cancelled"),
                    );
                }
                Err(LlmError::ContextOverflow(message)) => {
                    self.state = SessionState::Failed;
                    return TaskResult::failed_with_content(
                        collected,
                        TaskError::resource(ResourceKind::ContextWindow, estimated, estimated)
                            .with_details(serde_json::json!({ "provider_message": message })),
                    );
                }
                Err(error) => {
                    self.state = SessionState::Failed;
                    return TaskResult::failed_with_content(
                        collected,
                        TaskError::failure(FailureReason::UnexpectedError, error.to_string()),
                    );
                }
            };

            // A turn is counted only for assistant messages.
            self.meter.record_turn();
            let output_estimate = ResourceMeter::estimate_tokens(&response.content);
            self.meter
                .record_usage(response.usage, estimated + output_estimate);

            if !response.content.is_empty() {
                if !collected.is_empty() {
                    collected.push('\n');
                }
                collected.push_str(&response.content);
            }

            if response.tool_calls.is_empty() {
                self.history.push(LlmMessage::assistant(&response.content));
                self.state = SessionState::Complete;
                return TaskResult::complete(collected);
            }

            let mut blocks = Vec::new();
            if !response.content.is_empty() {
                blocks.push(ContentBlock::Text {
                    text: response.content.clone(),
                });
            }
            for call in &response.tool_calls {
                blocks.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
            }
            self.history.push(LlmMessage::assistant_blocks(blocks));

            // Direct tools run in emission order; the first subtask tool
            // wins the turn and later calls are answered as deferred.
            let mut continuation: Option<(ToolInvocation, SubtaskRequest)> = None;
            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            for call in response.tool_calls {
                if continuation.is_some() {
                    result_blocks.push(ContentBlock::ToolResult {
                        tool_use_id: call.id,
                        content: "deferred: a subtask is already pending for this turn".into(),
                        is_error: Some(true),
                    });
                    continue;
                }
                debug!("executing tool '{}'", call.name);
                let outcome = self
                    .tools
                    .execute_cancellable(&call.name, call.arguments.clone(), self.cancel.clone())
                    .await;
                match outcome {
                    ToolOutcome::Continuation(request) => continuation = Some((call, request)),
                    other => result_blocks.push(ContentBlock::ToolResult {
                        tool_use_id: call.id,
                        content: other.to_content_string(),
                        is_error: other.is_error().then_some(true),
                    }),
                }
            }

            if !result_blocks.is_empty() {
                for block in result_blocks {
                    self.push_tool_result(block);
                }
            }

            if let Some((call, request)) = continuation {
                self.pending_tool = Some(call);
                self.state = SessionState::ContinuationPending;
                return TaskResult::continuation(collected, request);
            }
            // Direct tools only: the turn continues with another call.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_core::TaskStatus;
    use taskloom_llm::{MockBehavior, MockProvider};
    use taskloom_tools::Tool;

    struct DoubleTool;

    #[async_trait::async_trait]
    impl Tool for DoubleTool {
        fn name(&self) -> &str {
            "double"
        }
        fn description(&self) -> &str {
            "Double a number"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"n": {"type": "integer"}}})
        }
        async fn execute(&self, args: serde_json::Value) -> ToolOutcome {
            match args["n"].as_i64() {
                Some(n) => ToolOutcome::text((n * 2).to_string()),
                None => ToolOutcome::error("'n' is required"),
            }
        }
    }

    struct SpawnStub;

    #[async_trait::async_trait]
    impl Tool for SpawnStub {
        fn name(&self) -> &str {
            "spawn_subtask"
        }
        fn description(&self) -> &str {
            "Spawn"
        }
        fn is_subtask(&self) -> bool {
            true
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, args: serde_json::Value) -> ToolOutcome {
            let name = args["task"].as_str().unwrap_or("child");
            ToolOutcome::Continuation(SubtaskRequest::named(name))
        }
    }

    fn session_with(provider: MockProvider, tools: ToolRegistry) -> Session {
        Session::new(
            Arc::new(provider),
            Arc::new(tools),
            "mock-model",
            "base prompt",
            ResourceMeter::new(10, 1_000_000, 1_000_000),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn text_only_turn_completes() {
        let mut session = session_with(
            MockProvider::constant(MockBehavior::Text("done".into())),
            ToolRegistry::new(),
        );
        let result = session.execute_prompt("go").await;
        assert_eq!(result.status, TaskStatus::Complete);
        assert_eq!(result.content, "done");
        assert_eq!(session.state(), SessionState::Complete);
        assert_eq!(session.meter().turns_used(), 1);

        // History: user, assistant
        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0].role, "user");
        assert_eq!(session.history()[1].role, "assistant");
    }

    #[tokio::test]
    async fn direct_tool_loops_until_text() {
        let provider = MockProvider::sequence(vec![
            MockBehavior::ToolCall {
                name: "double".into(),
                args: serde_json::json!({"n": 21}),
            },
            MockBehavior::Text("the answer is 42".into()),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(DoubleTool);

        let mut session = session_with(provider, tools);
        let result = session.execute_prompt("double 21").await;
        assert_eq!(result.status, TaskStatus::Complete);
        assert_eq!(result.content, "the answer is 42");
        // user, assistant(tool_use), user(tool_result), assistant(text)
        assert_eq!(session.history().len(), 4);
        assert_eq!(session.meter().turns_used(), 2);
    }

    #[tokio::test]
    async fn subtask_tool_returns_continuation() {
        let provider = MockProvider::constant(MockBehavior::ToolCall {
            name: "spawn_subtask".into(),
            args: serde_json::json!({"task": "child_task"}),
        });
        let mut tools = ToolRegistry::new();
        tools.register(SpawnStub);

        let mut session = session_with(provider, tools);
        let result = session.execute_prompt("delegate").await;
        assert_eq!(result.status, TaskStatus::Continuation);
        assert_eq!(session.state(), SessionState::ContinuationPending);
        let request = result.notes.subtask_request.unwrap();
        assert_eq!(request.name.as_deref(), Some("child_task"));
    }

    #[tokio::test]
    async fn continuation_stitches_tool_response() {
        // Scenario S6 shape
        let provider = MockProvider::sequence(vec![
            MockBehavior::ToolCall {
                name: "spawn_subtask".into(),
                args: serde_json::json!({"task": "child"}),
            },
            MockBehavior::Text("answer=42".into()),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(SpawnStub);

        let mut session = session_with(provider, tools);
        let first = session.execute_prompt("parent prompt").await;
        assert_eq!(first.status, TaskStatus::Continuation);

        session.add_tool_response("spawn_subtask", "42").unwrap();
        let second = session.execute_prompt("Continue based on the tool results.").await;
        assert_eq!(second.status, TaskStatus::Complete);
        assert_eq!(second.content, "answer=42");

        // History in order: user prompt, assistant (tool_use), tool
        // response, assistant (final) — no extra user message.
        let history = session.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[2].role, "user");
        assert!(matches!(
            &history[2].content,
            LlmContent::Blocks(blocks)
                if matches!(&blocks[0], ContentBlock::ToolResult { content, .. } if content == "42")
        ));
        assert_eq!(history[3].role, "assistant");
    }

    #[tokio::test]
    async fn add_tool_response_allowed_once() {
        let provider = MockProvider::constant(MockBehavior::ToolCall {
            name: "spawn_subtask".into(),
            args: serde_json::json!({"task": "child"}),
        });
        let mut tools = ToolRegistry::new();
        tools.register(SpawnStub);

        let mut session = session_with(provider, tools);
        session.execute_prompt("go").await;
        assert!(session.add_tool_response("spawn_subtask", "ok").is_ok());
        assert!(session.add_tool_response("spawn_subtask", "again").is_err());
    }

    #[tokio::test]
    async fn add_tool_response_checks_name() {
        let provider = MockProvider::constant(MockBehavior::ToolCall {
            name: "spawn_subtask".into(),
            args: serde_json::json!({"task": "child"}),
        });
        let mut tools = ToolRegistry::new();
        tools.register(SpawnStub);

        let mut session = session_with(provider, tools);
        session.execute_prompt("go").await;
        assert!(session.add_tool_response("other_tool", "nope").is_err());
        // Pending call survives a mismatched response
        assert!(session.add_tool_response("spawn_subtask", "ok").is_ok());
    }

    #[tokio::test]
    async fn turn_limit_short_circuits_before_llm() {
        let provider = MockProvider::constant(MockBehavior::Text("never".into()));
        let mut session = Session::new(
            Arc::new(provider),
            Arc::new(ToolRegistry::new()),
            "mock-model",
            "base",
            ResourceMeter::new(0, 1_000, 1_000_000),
            CancellationToken::new(),
        );
        let result = session.execute_prompt("go").await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.resource_kind(), Some(ResourceKind::Turns));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn exhaustion_midway_preserves_partial_content() {
        let provider = MockProvider::sequence(vec![
            MockBehavior::ToolCall {
                name: "double".into(),
                args: serde_json::json!({"n": 1}),
            },
            MockBehavior::Text("unreached".into()),
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(DoubleTool);

        let mut session = Session::new(
            Arc::new(provider),
            Arc::new(tools),
            "mock-model",
            "base",
            ResourceMeter::new(1, 1_000_000, 1_000_000),
            CancellationToken::new(),
        );
        let result = session.execute_prompt("go").await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.resource_kind(), Some(ResourceKind::Turns));
    }

    #[tokio::test]
    async fn cancellation_halts_turn() {
        let provider = MockProvider::constant(MockBehavior::Text("never".into()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = Session::new(
            Arc::new(provider),
            Arc::new(ToolRegistry::new()),
            "mock-model",
            "base",
            ResourceMeter::new(10, 1_000, 1_000_000),
            cancel,
        );
        let result = session.execute_prompt("go").await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(
            result.failure_reason(),
            Some(FailureReason::ExecutionHalted)
        );
    }

    #[tokio::test]
    async fn system_prompt_order_is_fixed() {
        let provider = MockProvider::echo();
        let mut session = session_with(provider, ToolRegistry::new());
        session.set_template_system(Some("template system".into()));
        session.prime_data_context(Some("context data".into()));

        let system = session.system_prompt();
        let base_pos = system.find("base prompt").unwrap();
        let template_pos = system.find("template system").unwrap();
        let context_pos = system.find("context data").unwrap();
        assert!(base_pos < template_pos && template_pos < context_pos);
    }

    #[tokio::test]
    async fn reset_clears_history_keeps_meter() {
        let provider = MockProvider::constant(MockBehavior::Text("hi".into()));
        let mut session = session_with(provider, ToolRegistry::new());
        session.execute_prompt("one").await;
        assert_eq!(session.meter().turns_used(), 1);

        session.reset();
        assert!(session.history().is_empty());
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.meter().turns_used(), 1);
    }
}
