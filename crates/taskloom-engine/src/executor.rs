//! Atomic task execution: parameter checks, placeholder substitution,
//! one handler turn, and output-format handling

use crate::session::Session;
use serde_json::{Map, Value};
use std::collections::HashSet;
use taskloom_core::{
    substitute_placeholders, FailureReason, OutputKind, TaskError, TaskResult, Template,
};

/// Run one atomic task body through a prepared handler session.
///
/// `inputs` must match the declared parameter set exactly; both missing
/// and extra keys fail before any LLM call.
pub async fn execute_body(
    template: &Template,
    inputs: &Map<String, Value>,
    session: &mut Session,
) -> TaskResult {
    if let Err(error) = check_params(template, inputs) {
        return TaskResult::failed(error).with_template(&template.name);
    }

    let instructions = match substitute_placeholders(&template.instructions, inputs) {
        Ok(text) => text,
        Err(message) => {
            return TaskResult::failed(TaskError::failure(
                FailureReason::InputValidationFailure,
                message,
            ))
            .with_template(&template.name)
        }
    };
    let system = match &template.system {
        Some(system) => match substitute_placeholders(system, inputs) {
            Ok(text) => Some(text),
            Err(message) => {
                return TaskResult::failed(TaskError::failure(
                    FailureReason::InputValidationFailure,
                    message,
                ))
                .with_template(&template.name)
            }
        },
        None => None,
    };
    session.set_template_system(system);

    let result = match template.max_duration_secs {
        Some(secs) => {
            let budget = std::time::Duration::from_secs(secs);
            match tokio::time::timeout(budget, session.execute_prompt(&instructions)).await {
                Ok(result) => result,
                Err(_) => TaskResult::failed(TaskError::failure(
                    FailureReason::ExecutionTimeout,
                    format!("task '{}' exceeded max_duration of {}s", template.name, secs),
                )),
            }
        }
        None => session.execute_prompt(&instructions).await,
    };
    apply_output_format(template, result).with_template(&template.name)
}

fn check_params(template: &Template, inputs: &Map<String, Value>) -> Result<(), TaskError> {
    let declared: HashSet<&str> = template.params.iter().map(String::as_str).collect();
    let provided: HashSet<&str> = inputs.keys().map(String::as_str).collect();

    let mut missing: Vec<&str> = declared.difference(&provided).copied().collect();
    let mut extra: Vec<&str> = provided.difference(&declared).copied().collect();
    missing.sort();
    extra.sort();

    if missing.is_empty() && extra.is_empty() {
        return Ok(());
    }
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("missing parameter(s): {}", missing.join(", ")));
    }
    if !extra.is_empty() {
        parts.push(format!("unknown parameter(s): {}", extra.join(", ")));
    }
    Err(TaskError::failure(
        FailureReason::InputValidationFailure,
        format!("task '{}': {}", template.name, parts.join("; ")),
    ))
}

/// Parse and shape-check JSON output when the template asks for it. On
/// failure the unparsed content is preserved in notes.original_content.
pub fn apply_output_format(template: &Template, mut result: TaskResult) -> TaskResult {
    let Some(format) = &template.output_format else {
        return result;
    };
    if format.kind != OutputKind::Json || !result.is_complete() {
        return result;
    }

    let raw = strip_code_fence(result.content.trim());
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            let mut failed = TaskResult::failed(TaskError::failure(
                FailureReason::OutputFormatFailure,
                format!("output is not valid JSON: {}", e),
            ));
            failed.notes.extra.insert(
                "original_content".to_string(),
                Value::String(result.content),
            );
            return failed;
        }
    };

    if !format.schema.matches(&parsed) {
        let mut failed = TaskResult::failed(TaskError::failure(
            FailureReason::OutputFormatFailure,
            format!("output does not match schema {:?}", format.schema),
        ));
        failed.notes.extra.insert(
            "original_content".to_string(),
            Value::String(result.content),
        );
        return failed;
    }

    result.parsed_content = Some(parsed);
    result
}

/// Models often wrap JSON in a markdown fence; accept that.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim().strip_suffix("```").map(str::trim).unwrap_or(trimmed)
}
