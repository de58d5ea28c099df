//! Request dispatcher: route raw input to the evaluator, a named task,
//! or a direct tool, and format the final result
//!
//! Input whose first non-whitespace character is `(` is an S-expression
//! workflow. Anything else is `identifier [key=value ...]`, resolved
//! against the template registry first and the tool registry second.

use serde_json::{Map, Value};
use std::sync::Arc;
use taskloom_core::{
    ErrorReason, FailureKind, FailureReason, SubtaskRequest, TaskResult, TaskStatus,
};
use taskloom_engine::Engine;
use taskloom_tools::Tool;
use tracing::debug;

/// Exit codes for the CLI surface.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const PARSE_ERROR: i32 = 2;
    pub const INPUT_VALIDATION: i32 = 3;
    pub const RESOURCE_EXHAUSTION: i32 = 4;
    pub const TASK_FAILURE: i32 = 5;
    pub const IDENTIFIER_NOT_FOUND: i32 = 6;
    pub const CANCELLED: i32 = 7;
}

#[derive(Debug)]
pub enum DispatchOutput {
    Result(TaskResult),
    Help(String),
    ParseError(String),
}

impl DispatchOutput {
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchOutput::Help(_) => exit_code::SUCCESS,
            DispatchOutput::ParseError(_) => exit_code::PARSE_ERROR,
            DispatchOutput::Result(result) => result_exit_code(result),
        }
    }
}

fn result_exit_code(result: &TaskResult) -> i32 {
    if result.status != TaskStatus::Failed {
        return exit_code::SUCCESS;
    }
    let Some(error) = &result.notes.error else {
        return exit_code::TASK_FAILURE;
    };
    if error.kind == FailureKind::ResourceExhaustion {
        return exit_code::RESOURCE_EXHAUSTION;
    }
    match error.reason {
        ErrorReason::Failure(FailureReason::InputValidationFailure) => exit_code::INPUT_VALIDATION,
        ErrorReason::Failure(FailureReason::IdentifierNotFound) => exit_code::IDENTIFIER_NOT_FOUND,
        ErrorReason::Failure(FailureReason::ExecutionHalted) if error.message == "cancelled" => {
            exit_code::CANCELLED
        }
        _ => exit_code::TASK_FAILURE,
    }
}

pub struct Dispatcher {
    engine: Arc<Engine>,
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn dispatch(&self, input: &str) -> DispatchOutput {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return DispatchOutput::ParseError("empty input".to_string());
        }

        if trimmed.starts_with('(') {
            debug!("dispatching S-expression workflow");
            return match self.engine.eval_workflow(trimmed).await {
                Ok(result) => DispatchOutput::Result(result),
                Err(parse_error) => DispatchOutput::ParseError(parse_error.to_string()),
            };
        }

        let tokens = match split_tokens(trimmed) {
            Ok(tokens) => tokens,
            Err(message) => return DispatchOutput::ParseError(message),
        };
        let (identifier, args) = tokens.split_first().expect("non-empty input");
        let wants_help = args.iter().any(|a| a == "--help");
        let args: Vec<&String> = args.iter().filter(|a| *a != "--help").collect();

        if let Some(template) = self.engine.templates().find(identifier) {
            if wants_help {
                return DispatchOutput::Help(render_template_help(&template));
            }
            let mut request = SubtaskRequest::named(&template.name);
            match parse_key_values(&args) {
                Ok(inputs) => {
                    for (key, value) in inputs {
                        if key == "max_depth" && !template.params.iter().any(|p| p == "max_depth")
                        {
                            request.max_depth = value.as_u64().map(|d| d as usize).or_else(|| {
                                value.as_str().and_then(|s| s.parse().ok())
                            });
                        } else {
                            request.inputs.insert(key, value);
                        }
                    }
                }
                Err(result) => return DispatchOutput::Result(result),
            }
            return DispatchOutput::Result(self.engine.run_request(request).await);
        }

        if let Some(tool) = self.engine.tools().get(identifier) {
            if wants_help {
                return DispatchOutput::Help(render_tool_help(
                    tool.name(),
                    tool.description(),
                    &tool.input_schema(),
                ));
            }
            let tool_args = match parse_key_values(&args) {
                Ok(map) => Value::Object(map),
                Err(result) => return DispatchOutput::Result(result),
            };
            use taskloom_lang::WorkflowHost;
            return DispatchOutput::Result(self.engine.execute_tool(identifier, tool_args).await);
        }

        DispatchOutput::Result(TaskResult::failed(taskloom_core::TaskError::failure(
            FailureReason::IdentifierNotFound,
            format!("'{}' is neither a registered task nor a tool", identifier),
        )))
    }
}

/// Whitespace-split that keeps quoted spans together.
fn split_tokens(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if quote.is_some() {
        return Err("unterminated quote in arguments".to_string());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parse `key=value` tokens. Values that look like JSON must parse as
/// JSON; everything else stays a literal string.
fn parse_key_values(args: &[&String]) -> Result<Map<String, Value>, TaskResult> {
    let invalid = |message: String| {
        TaskResult::failed(taskloom_core::TaskError::failure(
            FailureReason::InputValidationFailure,
            message,
        ))
    };

    let mut map = Map::new();
    for arg in args {
        let Some((key, raw)) = arg.split_once('=') else {
            return Err(invalid(format!("expected key=value, got '{}'", arg)));
        };
        if key.is_empty() {
            return Err(invalid(format!("empty key in '{}'", arg)));
        }
        let value = if raw.starts_with('{') || raw.starts_with('[') || raw.starts_with('"') {
            match serde_json::from_str(raw) {
                Ok(value) => value,
                Err(e) => return Err(invalid(format!("malformed JSON for '{}': {}", key, e))),
            }
        } else {
            Value::String(raw.to_string())
        };
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn render_template_help(template: &taskloom_core::Template) -> String {
    let mut out = String::new();
    out.push_str(&template.name);
    if let Some(description) = &template.description {
        out.push_str(" — ");
        out.push_str(description);
    }
    out.push('\n');
    if template.params.is_empty() {
        out.push_str("parameters: none\n");
    } else {
        out.push_str("parameters:\n");
        for param in &template.params {
            match template.param_types.get(param).and_then(Value::as_str) {
                Some(hint) => out.push_str(&format!("  {} ({})\n", param, hint)),
                None => out.push_str(&format!("  {}\n", param)),
            }
        }
    }
    out.push_str(&format!("subtype: {}\n", template.subtype));
    out
}

fn render_tool_help(name: &str, description: &str, schema: &Value) -> String {
    let mut out = format!("{} — {}\n", name, description);
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        out.push_str("arguments:\n");
        let mut keys: Vec<&String> = properties.keys().collect();
        keys.sort();
        for key in keys {
            let hint = properties[key]
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            out.push_str(&format!("  {} — {}\n", key, hint));
        }
    }
    out
}

/// Human-readable rendering: a short header with status, reason, and
/// message, then the content.
pub fn render_human(result: &TaskResult) -> String {
    let mut header = format!("{:?}", result.status).to_uppercase();
    if let Some(error) = &result.notes.error {
        let reason = serde_json::to_value(error.reason)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        header.push_str(&format!(" {} — {}", reason, error.message));
    }
    if result.content.is_empty() {
        header
    } else {
        format!("{}\n{}", header, result.content)
    }
}

pub fn render_json(result: &TaskResult) -> String {
    serde_json::to_string_pretty(result).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}
