//! Spawn tool — request a subtask from within an LLM turn
//!
//! The tool itself never runs the child. It validates the arguments,
//! builds a SubtaskRequest, and hands it back as a Continuation outcome;
//! the subtask loop owns execution and folds the child's result back into
//! the parent turn as a tool response.

use crate::registry::{Tool, ToolOutcome};
use serde_json::{json, Map, Value};
use taskloom_core::{ContextManagement, SubtaskRequest};

pub struct SpawnTaskTool;

impl SpawnTaskTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SpawnTaskTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for SpawnTaskTool {
    fn name(&self) -> &str {
        "spawn_subtask"
    }

    fn description(&self) -> &str {
        "Spawn a registered atomic task as a subtask. The subtask runs with \
         its own context and conversation; its result comes back as this \
         tool's response."
    }

    fn prompt(&self) -> &str {
        "Use spawn_subtask to delegate work to a registered task. Provide the \
         task name, its inputs, and optionally file_context paths."
    }

    fn is_subtask(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "Name of the registered atomic task"
                },
                "subtype": {
                    "type": "string",
                    "description": "Task subtype, used when no name is given"
                },
                "prompt": {
                    "type": "string",
                    "description": "Free-form prompt, passed as the 'prompt' input"
                },
                "inputs": {
                    "type": "object",
                    "description": "Task parameter values keyed by parameter name"
                },
                "file_context": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Absolute file paths to include in the subtask context"
                },
                "context_management": {
                    "type": "object",
                    "description": "Context overrides: inherit_context, accumulate_data, accumulation_format, fresh_context"
                },
                "max_depth": {
                    "type": "integer",
                    "description": "Maximum subtask nesting depth"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        match build_request(&args) {
            Ok(request) => ToolOutcome::Continuation(request),
            Err(message) => ToolOutcome::error(message),
        }
    }
}

fn build_request(args: &Value) -> Result<SubtaskRequest, String> {
    let name = args["task"].as_str().map(String::from);
    let subtype = args["subtype"].as_str().map(String::from);
    if name.is_none() && subtype.is_none() {
        return Err("one of 'task' or 'subtype' is required".to_string());
    }

    let mut inputs: Map<String, Value> = match args.get("inputs") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err("'inputs' must be an object".to_string()),
    };
    if let Some(prompt) = args["prompt"].as_str() {
        inputs
            .entry("prompt".to_string())
            .or_insert_with(|| Value::String(prompt.to_string()));
    }

    let file_paths = match args.get("file_context") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => {
            let mut paths = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(p) => paths.push(p.into()),
                    None => return Err("'file_context' entries must be strings".to_string()),
                }
            }
            Some(paths)
        }
        Some(_) => return Err("'file_context' must be an array of strings".to_string()),
    };

    let context_management: Option<ContextManagement> = match args.get("context_management") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value(value.clone())
                .map_err(|e| format!("invalid context_management: {}", e))?,
        ),
    };

    let max_depth = args["max_depth"].as_u64().map(|d| d as usize);

    Ok(SubtaskRequest {
        task_type: "atomic".to_string(),
        name,
        subtype,
        inputs,
        file_paths,
        context_management,
        max_depth,
        template_hints: None,
    })
}
