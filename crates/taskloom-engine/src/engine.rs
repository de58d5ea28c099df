//! Engine: owns the registries, resolver, and provider; runs requests
//! through the atomic executor and folds CONTINUATIONs via the subtask
//! loop

use crate::config::EngineConfig;
use crate::context::{ContextResolver, ParentContext, ResolvedContext};
use crate::executor;
use crate::index::{FileIndex, LexicalMatcher, Matcher};
use crate::meter::ResourceMeter;
use crate::session::Session;
use crate::subtask::SubtaskStack;
use crate::templates::TemplateRegistry;
use async_recursion::async_recursion;
use serde_json::{json, Value as Json};
use std::sync::Arc;
use taskloom_core::{
    AssociativeMatchResult, ContextGenerationInput, FailureReason, SubtaskRequest, TaskError,
    TaskResult, Template,
};
use taskloom_lang::{EvalError, Evaluator, ParseError, Value, WorkflowHost};
use taskloom_llm::LlmProvider;
use taskloom_tools::{ToolOutcome, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CONTINUE_PROMPT: &str = "Continue based on the tool results.";

pub struct Engine {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    templates: TemplateRegistry,
    index: Arc<FileIndex>,
    matcher: Arc<dyn Matcher>,
    resolver: ContextResolver,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(provider: Arc<dyn LlmProvider>, tools: ToolRegistry, config: EngineConfig) -> Self {
        Self::with_matcher(provider, tools, config, Arc::new(LexicalMatcher::default()))
    }

    pub fn with_matcher(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        config: EngineConfig,
        matcher: Arc<dyn Matcher>,
    ) -> Self {
        let tools = Arc::new(tools);
        let index = Arc::new(FileIndex::new());
        let resolver = ContextResolver::new(
            index.clone(),
            matcher.clone(),
            tools.clone(),
            config.workdir.clone(),
        );
        Self {
            provider,
            tools,
            templates: TemplateRegistry::new(),
            index,
            matcher,
            resolver,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.index
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Execute one request to a terminal result.
    pub async fn run_request(&self, request: SubtaskRequest) -> TaskResult {
        let mut stack = SubtaskStack::new();
        self.execute_request(request, &mut stack, None).await
    }

    /// Evaluate an S-expression workflow. Parse errors surface separately
    /// so callers can distinguish bad input from failed execution.
    pub async fn eval_workflow(self: &Arc<Self>, source: &str) -> Result<TaskResult, ParseError> {
        let host: Arc<dyn WorkflowHost> = self.clone();
        let evaluator = Evaluator::new(host);
        match evaluator.eval_source(source).await {
            Ok(Value::Task(result)) => Ok(*result),
            Ok(value) => Ok(TaskResult::complete(value.to_string())),
            Err(EvalError::Parse(e)) => Err(e),
            Err(EvalError::Task(error)) => Ok(TaskResult::failed(error)),
        }
    }

    fn find_template(&self, request: &SubtaskRequest) -> Option<Arc<Template>> {
        if let Some(name) = &request.name {
            if let Some(template) = self.templates.find(name) {
                return Some(template);
            }
        }
        if let Some(subtype) = &request.subtype {
            if let Some(template) = self.templates.find(subtype) {
                return Some(template);
            }
        }
        if let Some(hints) = &request.template_hints {
            let joined = hints.join(" ");
            if let Some((template, score)) = self.templates.find_matching(&joined).into_iter().next()
            {
                debug!(
                    "resolved request via template hints to '{}' (score {:.2})",
                    template.name, score
                );
                return Some(template);
            }
        }
        None
    }

    #[async_recursion]
    async fn execute_request(
        &self,
        request: SubtaskRequest,
        stack: &mut SubtaskStack,
        parent: Option<ParentContext>,
    ) -> TaskResult {
        if request.task_type != "atomic" {
            return TaskResult::failed(TaskError::failure(
                FailureReason::InputValidationFailure,
                format!("request type must be 'atomic', got '{}'", request.task_type),
            ));
        }
        let Some(template) = self.find_template(&request) else {
            return TaskResult::failed(TaskError::failure(
                FailureReason::IdentifierNotFound,
                format!("no template matches '{}'", request.identifier()),
            ));
        };

        // Depth and cycle limits, checked before any context I/O or LLM
        // call.
        if let Err(error) = stack.check(&request, self.config.max_depth) {
            return TaskResult::failed(error).with_template(&template.name);
        }
        stack.push(&request);
        let result = self.run_atomic(&template, &request, stack, parent).await;
        stack.pop();
        result
    }

    async fn run_atomic(
        &self,
        template: &Template,
        request: &SubtaskRequest,
        stack: &mut SubtaskStack,
        parent: Option<ParentContext>,
    ) -> TaskResult {
        let resolved = match self.resolver.resolve(template, request, parent.as_ref()).await {
            Ok(resolved) => resolved,
            Err(error) => return TaskResult::failed(error).with_template(&template.name),
        };

        let model = template
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let max_context = self.provider.max_context_tokens(&model);
        let tokens_limit = (self.config.max_tokens_fraction * max_context as f64) as u64;
        let meter = ResourceMeter::new(self.config.max_turns, tokens_limit, max_context);

        let mut session = Session::new(
            self.provider.clone(),
            self.tools.clone(),
            model,
            self.config.base_prompt.clone(),
            meter,
            self.cancel.child_token(),
        );
        session.prime_data_context(Some(resolved.context_string.clone()));

        let mut result = executor::execute_body(template, &request.inputs, &mut session).await;
        annotate(&mut result, &resolved);

        // Subtask loop: fold each CONTINUATION back as a tool response and
        // continue the parent turn.
        let mut iterations: Vec<TaskResult> = Vec::new();
        while result.is_continuation() {
            let Some(mut child_request) = result.notes.subtask_request.clone() else {
                return TaskResult::failed(TaskError::failure(
                    FailureReason::UnexpectedError,
                    "CONTINUATION carried no subtask_request",
                ))
                .with_template(&template.name);
            };
            // The depth bound travels down unless the child sets its own.
            if child_request.max_depth.is_none() {
                child_request.max_depth = request.max_depth;
            }

            // Depth and cycle limits are checked before the child sees an
            // LLM; a violation halts this task directly.
            if let Err(error) = stack.check(&child_request, self.config.max_depth) {
                return TaskResult::failed_with_content(result.content.clone(), error)
                    .with_template(&template.name);
            }

            info!(
                "task '{}' spawning subtask '{}' at depth {}",
                template.name,
                child_request.identifier(),
                stack.depth()
            );
            let parent_ctx = ParentContext {
                content: resolved.context_string.clone(),
                prior_results: iterations.clone(),
            };
            let child = self
                .execute_request(child_request.clone(), stack, Some(parent_ctx))
                .await;

            if child.is_failed() {
                let child_error = child.notes.error.clone();
                // A depth or cycle halt aborts the whole workflow; it
                // propagates unwrapped so the top level reports
                // execution_halted with the offending depth.
                if let Some(error) = &child_error {
                    if error.failure_reason() == Some(FailureReason::ExecutionHalted) {
                        return TaskResult::failed_with_content(
                            result.content.clone(),
                            error.clone(),
                        )
                        .with_template(&template.name);
                    }
                }
                let mut details = json!({
                    "subtask_request": child_request,
                    "subtask_error": child_error,
                    "depth": stack.depth(),
                });
                if !child.content.is_empty() {
                    details["partial_output"] = Json::String(child.content.clone());
                }
                let error = TaskError::failure(
                    FailureReason::SubtaskFailure,
                    format!("subtask '{}' failed", child_request.identifier()),
                )
                .with_details(details);
                return TaskResult::failed_with_content(result.content.clone(), error)
                    .with_template(&template.name);
            }

            iterations.push(child.clone());
            let tool_name = session
                .pending_tool_name()
                .unwrap_or("spawn_subtask")
                .to_string();
            if let Err(error) = session.add_tool_response(&tool_name, &child.content) {
                return TaskResult::failed(error).with_template(&template.name);
            }
            result = session.execute_prompt(CONTINUE_PROMPT).await;
            result = executor::apply_output_format(template, result).with_template(&template.name);
            annotate(&mut result, &resolved);
        }

        if !iterations.is_empty() {
            result.notes.iteration_history = Some(iterations);
        }
        result
    }
}

fn annotate(result: &mut TaskResult, resolved: &ResolvedContext) {
    result.notes.context_source = Some(resolved.source);
    result.notes.context_files_count = Some(resolved.files_count);
    if resolved.empty_warning {
        result
            .notes
            .extra
            .insert("warning".to_string(), Json::String("EMPTY_CONTEXT".into()));
    }
}

#[async_trait::async_trait]
impl WorkflowHost for Engine {
    async fn execute_task(&self, request: SubtaskRequest) -> TaskResult {
        self.run_request(request).await
    }

    async fn execute_tool(&self, name: &str, args: Json) -> TaskResult {
        let outcome = self
            .tools
            .execute_cancellable(name, args, self.cancel.child_token())
            .await;
        match outcome {
            ToolOutcome::Text(content) => TaskResult::complete(content),
            ToolOutcome::Json(value) => {
                let mut result = TaskResult::complete(
                    serde_json::to_string_pretty(&value).unwrap_or_default(),
                );
                result.parsed_content = Some(value);
                result
            }
            ToolOutcome::Error(message) => TaskResult::failed(TaskError::failure(
                FailureReason::UnexpectedError,
                format!("tool '{}': {}", name, message),
            )),
            // A tool-initiated subtask runs like any other request.
            ToolOutcome::Continuation(request) => self.run_request(request).await,
        }
    }

    fn register_template(&self, template: Template) -> Result<(), String> {
        self.templates.register(template).map_err(|e| e.to_string())
    }

    fn template_exists(&self, name: &str) -> bool {
        self.templates.find(name).is_some()
    }

    fn template_params(&self, name: &str) -> Option<Vec<String>> {
        self.templates.find(name).map(|t| t.params.clone())
    }

    fn tool_exists(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    async fn match_context(&self, input: ContextGenerationInput) -> AssociativeMatchResult {
        self.matcher.find_matches(&input, &self.index).await
    }
}
