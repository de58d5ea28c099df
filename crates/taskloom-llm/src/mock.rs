//! MockProvider — deterministic LLM responses for testing
//!
//! Implements the LlmProvider trait with canned behaviors so the engine,
//! evaluator, and end-to-end scenarios run without network access.

use crate::provider::{LlmError, LlmProvider, LlmResult};
use crate::types::{LlmRequest, LlmResponse, ToolInvocation, Usage};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Mock behavior configuration
#[derive(Clone, Debug)]
pub enum MockBehavior {
    /// Return a fixed text response
    Text(String),
    /// Echo the last user message back verbatim
    EchoPrompt,
    /// Return a single tool_use call with given name and args
    ToolCall { name: String, args: Value },
    /// Return multiple tool_use calls in one turn
    MultiToolCall(Vec<(String, Value)>),
    /// Return text followed by a tool call
    TextThenTool {
        text: String,
        tool_name: String,
        tool_args: Value,
    },
    /// Fail the call
    Error(String),
}

/// A sequence of behaviors — each call to complete pops the next one.
/// When the sequence is exhausted, the default behavior applies.
pub struct MockProvider {
    behaviors: Mutex<Vec<MockBehavior>>,
    default_behavior: MockBehavior,
    call_counter: AtomicU64,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockProvider {
    /// A mock that always returns the same behavior.
    pub fn constant(behavior: MockBehavior) -> Self {
        Self {
            behaviors: Mutex::new(Vec::new()),
            default_behavior: behavior,
            call_counter: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A mock with a sequence of behaviors, consumed in order.
    pub fn sequence(behaviors: Vec<MockBehavior>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors),
            default_behavior: MockBehavior::Text("(mock: sequence exhausted)".into()),
            call_counter: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A mock that echoes the last user message.
    pub fn echo() -> Self {
        Self::constant(MockBehavior::EchoPrompt)
    }

    pub fn call_count(&self) -> u64 {
        self.call_counter.load(Ordering::SeqCst)
    }

    /// Snapshot of every request received, in order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_behavior(&self) -> MockBehavior {
        self.call_counter.fetch_add(1, Ordering::SeqCst);
        let mut behaviors = self.behaviors.lock().unwrap();
        if behaviors.is_empty() {
            self.default_behavior.clone()
        } else {
            behaviors.remove(0)
        }
    }

    fn render(&self, behavior: MockBehavior, request: &LlmRequest) -> LlmResult<LlmResponse> {
        let call_id = self.call_counter.load(Ordering::SeqCst);
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 10,
        };

        match behavior {
            MockBehavior::Text(text) => Ok(LlmResponse {
                content: text,
                tool_calls: Vec::new(),
                stop_reason: Some("end_turn".into()),
                usage: Some(usage),
            }),
            MockBehavior::EchoPrompt => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "user")
                    .map(|m| m.text())
                    .unwrap_or_default();
                Ok(LlmResponse {
                    content: last_user,
                    tool_calls: Vec::new(),
                    stop_reason: Some("end_turn".into()),
                    usage: Some(usage),
                })
            }
            MockBehavior::ToolCall { name, args } => Ok(LlmResponse {
                content: String::new(),
                tool_calls: vec![ToolInvocation {
                    id: format!("mock-tool-{}", call_id),
                    name,
                    arguments: args,
                }],
                stop_reason: Some("tool_use".into()),
                usage: Some(usage),
            }),
            MockBehavior::MultiToolCall(calls) => Ok(LlmResponse {
                content: String::new(),
                tool_calls: calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, args))| ToolInvocation {
                        id: format!("mock-tool-{}-{}", call_id, i),
                        name,
                        arguments: args,
                    })
                    .collect(),
                stop_reason: Some("tool_use".into()),
                usage: Some(usage),
            }),
            MockBehavior::TextThenTool {
                text,
                tool_name,
                tool_args,
            } => Ok(LlmResponse {
                content: text,
                tool_calls: vec![ToolInvocation {
                    id: format!("mock-tool-{}", call_id),
                    name: tool_name,
                    arguments: tool_args,
                }],
                stop_reason: Some("tool_use".into()),
                usage: Some(usage),
            }),
            MockBehavior::Error(message) => Err(LlmError::RequestFailed(message)),
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn models(&self) -> &[&str] {
        &["mock-model"]
    }

    async fn complete(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmResponse> {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
        }
        let behavior = self.next_behavior();
        self.requests.lock().unwrap().push(request.clone());
        self.render(behavior, &request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LlmMessage;

    #[tokio::test]
    async fn echo_returns_last_user_message() {
        let provider = MockProvider::echo();
        let request = LlmRequest {
            messages: vec![LlmMessage::user("Say: hello")],
            ..Default::default()
        };
        let response = provider.complete(request, None).await.unwrap();
        assert_eq!(response.content, "Say: hello");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn sequence_is_consumed_in_order() {
        let provider = MockProvider::sequence(vec![
            MockBehavior::Text("first".into()),
            MockBehavior::Text("second".into()),
        ]);
        let req = LlmRequest::default();
        assert_eq!(
            provider.complete(req.clone(), None).await.unwrap().content,
            "first"
        );
        assert_eq!(
            provider.complete(req.clone(), None).await.unwrap().content,
            "second"
        );
        // Exhausted — default kicks in
        assert!(provider
            .complete(req, None)
            .await
            .unwrap()
            .content
            .contains("exhausted"));
    }

    #[tokio::test]
    async fn tool_call_behavior_emits_invocation() {
        let provider = MockProvider::constant(MockBehavior::ToolCall {
            name: "read_file".into(),
            args: serde_json::json!({"path": "/tmp/x"}),
        });
        let response = provider.complete(LlmRequest::default(), None).await.unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "read_file");
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let provider = MockProvider::echo();
        let token = CancellationToken::new();
        token.cancel();
        let err = provider
            .complete(LlmRequest::default(), Some(token))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
    }
}
