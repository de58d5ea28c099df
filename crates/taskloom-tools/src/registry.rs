//! Tool trait and registry
//!
//! Tools come in two kinds. A direct tool does its work inline and hands
//! text (or an error) straight back into the turn. A subtask tool never
//! runs the work itself: it validates its arguments into a SubtaskRequest
//! and yields a Continuation outcome, which ends the turn and passes
//! control to the subtask loop.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use taskloom_core::SubtaskRequest;
use taskloom_llm::LlmTool;
use tokio_util::sync::CancellationToken;

/// What one tool invocation produced.
#[derive(Clone, Debug)]
pub enum ToolOutcome {
    Text(String),
    Json(Value),
    Error(String),
    /// A subtask to spawn in place of an inline result. The session stops
    /// the turn here; the subtask loop folds the child's result back in
    /// later via add_tool_response.
    Continuation(SubtaskRequest),
}

impl ToolOutcome {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error(s.into())
    }

    /// The string form that goes into a tool-response message.
    pub fn to_content_string(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => serde_json::to_string_pretty(v).unwrap_or_default(),
            Self::Error(e) => format!("Error: {}", e),
            Self::Continuation(req) => format!("[subtask: {}]", req.identifier()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_continuation(&self) -> bool {
        matches!(self, Self::Continuation(_))
    }
}

/// One capability the LLM can call during a turn.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Registry key; also the name the LLM sees.
    fn name(&self) -> &str;

    /// One-line summary advertised in the tool definition.
    fn description(&self) -> &str;

    /// Optional usage guidance folded into the session's system prompt.
    fn prompt(&self) -> &str {
        ""
    }

    /// JSON Schema for the accepted arguments.
    fn input_schema(&self) -> Value;

    /// True when the tool never mutates anything.
    fn is_read_only(&self) -> bool {
        false
    }

    /// True for tools whose outcome is a Continuation rather than inline
    /// work.
    fn is_subtask(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> ToolOutcome;

    /// Cancellation-aware entry point used by the session. The default
    /// abandons the in-flight result once the workflow token fires, which
    /// is enough for pure-async tools; anything holding a child process
    /// overrides this so cancellation also reaps the process.
    async fn execute_cancellable(&self, args: Value, cancel: CancellationToken) -> ToolOutcome {
        if cancel.is_cancelled() {
            return ToolOutcome::error("cancelled before execution");
        }
        tokio::select! {
            _ = cancel.cancelled() => ToolOutcome::error("cancelled mid-execution"),
            outcome = self.execute(args) => outcome,
        }
    }

    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Name-keyed store of tools, shared by every session of one engine.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
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
        }
    }

    /// Register under the tool's own name. A duplicate name replaces the
    /// earlier tool.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Run a tool with no outside cancellation.
    pub async fn execute(&self, name: &str, args: Value) -> ToolOutcome {
        self.execute_cancellable(name, args, CancellationToken::new())
            .await
    }

    pub async fn execute_cancellable(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolOutcome {
        match self.tools.get(name) {
            Some(tool) => tool.execute_cancellable(args, cancel).await,
            None => ToolOutcome::error(format!("no tool named '{}'", name)),
        }
    }

    /// Definitions advertised to the LLM, in name order so identical
    /// registries always produce identical prompts.
    pub fn definitions(&self) -> Vec<LlmTool> {
        let mut entries: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries.into_iter().map(|t| t.to_llm_tool()).collect()
    }

    /// Usage guidance from every tool that offers some, name-sorted for
    /// the same determinism as definitions().
    pub fn combined_prompts(&self) -> String {
        let mut entries: Vec<(&str, &str)> = self
            .tools
            .values()
            .map(|t| (t.name(), t.prompt()))
            .filter(|(_, p)| !p.is_empty())
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(_, p)| p)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UpperTool;

    #[async_trait::async_trait]
    impl Tool for UpperTool {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "Uppercase a string"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, args: Value) -> ToolOutcome {
            match args["text"].as_str() {
                Some(t) => ToolOutcome::text(t.to_uppercase()),
                None => ToolOutcome::error("'text' is required"),
            }
        }
    }

    struct SpawnStub;

    #[async_trait::async_trait]
    impl Tool for SpawnStub {
        fn name(&self) -> &str {
            "spawn_stub"
        }
        fn description(&self) -> &str {
            "Spawn a canned subtask"
        }
        fn is_subtask(&self) -> bool {
            true
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _args: Value) -> ToolOutcome {
            ToolOutcome::Continuation(SubtaskRequest::named("child"))
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(UpperTool);

        assert!(registry.contains("upper"));
        let outcome = registry
            .execute("upper", serde_json::json!({"text": "abc"}))
            .await;
        assert_eq!(outcome.to_content_string(), "ABC");
    }

    #[tokio::test]
    async fn missing_tool_is_error() {
        let registry = ToolRegistry::new();
        let outcome = registry.execute("nope", serde_json::json!({})).await;
        assert!(outcome.is_error());
    }

    #[tokio::test]
    async fn subtask_tool_yields_continuation() {
        let mut registry = ToolRegistry::new();
        registry.register(SpawnStub);
        let outcome = registry.execute("spawn_stub", serde_json::json!({})).await;
        assert!(outcome.is_continuation());
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(UpperTool);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = registry
            .execute_cancellable("upper", serde_json::json!({"text": "abc"}), cancel)
            .await;
        assert!(outcome.is_error());
        assert!(outcome.to_content_string().contains("cancelled"));
    }

    #[test]
    fn definitions_are_name_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(UpperTool);
        registry.register(SpawnStub);
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["spawn_stub".to_string(), "upper".to_string()]);
    }
}
