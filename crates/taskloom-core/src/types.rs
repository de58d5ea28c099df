//! Core types for Taskloom: task results, subtask requests, context knobs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Terminal or non-terminal outcome of one task execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "CONTINUATION")]
    Continuation,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Top-level error kind. Each kind carries a closed reason enumeration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    #[serde(rename = "RESOURCE_EXHAUSTION")]
    ResourceExhaustion,
    #[serde(rename = "TASK_FAILURE")]
    TaskFailure,
}

/// Resource that was exhausted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Turns,
    ContextWindow,
    Tokens,
    OutputSize,
}

/// Closed reason set for TASK_FAILURE.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ContextRetrievalFailure,
    ContextMatchingFailure,
    ContextParsingFailure,
    ContextConstraintViolation,
    XmlValidationFailure,
    OutputFormatFailure,
    ExecutionTimeout,
    ExecutionHalted,
    SubtaskFailure,
    InputValidationFailure,
    UndefinedOperator,
    UnboundSymbol,
    ArityMismatch,
    IdentifierNotFound,
    UnexpectedError,
}

/// Reason field of a TaskError. Serialises as the bare reason string for
/// either kind; the two name sets are disjoint so deserialisation is
/// unambiguous.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ErrorReason {
    Resource(ResourceKind),
    Failure(FailureReason),
}

/// Structured error carried in `TaskResult.notes.error`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(rename = "type")]
    pub kind: FailureKind,
    pub reason: ErrorReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    pub fn failure(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::TaskFailure,
            reason: ErrorReason::Failure(reason),
            message: message.into(),
            details: None,
        }
    }

    pub fn resource(resource: ResourceKind, usage: u64, limit: u64) -> Self {
        Self {
            kind: FailureKind::ResourceExhaustion,
            reason: ErrorReason::Resource(resource),
            message: format!(
                "resource limit reached: {:?} ({} of {})",
                resource, usage, limit
            ),
            details: Some(serde_json::json!({ "usage": usage, "limit": limit })),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self.reason {
            ErrorReason::Failure(r) => Some(r),
            ErrorReason::Resource(_) => None,
        }
    }

    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self.reason {
            ErrorReason::Resource(r) => Some(r),
            ErrorReason::Failure(_) => None,
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = serde_json::to_value(self.reason)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        write!(f, "{:?}/{}: {}", self.kind, reason, self.message)
    }
}

/// Where the final context came from, recorded in notes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    Explicit,
    Template,
    Automatic,
    Inherited,
    None,
}

/// Open key/value bag attached to every TaskResult, with typed slots for
/// the fields the runtime itself reads and writes.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskNotes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_request: Option<SubtaskRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_source: Option<ContextSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_files_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_history: Option<Vec<TaskResult>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The universal result record. Every component boundary speaks this.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_content: Option<Value>,
    #[serde(default)]
    pub notes: TaskNotes,
}

impl TaskResult {
    pub fn complete(content: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Complete,
            content: content.into(),
            parsed_content: None,
            notes: TaskNotes::default(),
        }
    }

    pub fn continuation(content: impl Into<String>, request: SubtaskRequest) -> Self {
        Self {
            status: TaskStatus::Continuation,
            content: content.into(),
            parsed_content: None,
            notes: TaskNotes {
                subtask_request: Some(request),
                ..Default::default()
            },
        }
    }

    pub fn failed(error: TaskError) -> Self {
        Self::failed_with_content(String::new(), error)
    }

    /// A failure that preserves partial content accumulated before the error.
    pub fn failed_with_content(content: impl Into<String>, error: TaskError) -> Self {
        Self {
            status: TaskStatus::Failed,
            content: content.into(),
            parsed_content: None,
            notes: TaskNotes {
                error: Some(error),
                ..Default::default()
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == TaskStatus::Complete
    }

    pub fn is_continuation(&self) -> bool {
        self.status == TaskStatus::Continuation
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.notes.error.as_ref().and_then(|e| e.failure_reason())
    }

    pub fn resource_kind(&self) -> Option<ResourceKind> {
        self.notes.error.as_ref().and_then(|e| e.resource_kind())
    }

    pub fn with_template(mut self, name: impl Into<String>) -> Self {
        self.notes.template_used = Some(name.into());
        self
    }
}

/// Inheritance knob: what the child sees of the parent's context.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InheritContext {
    Full,
    None,
    Subset,
}

/// How accumulated prior outputs are rendered into the context block.
/// `notes_only` and `full_output` are accepted as legacy aliases.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccumulationFormat {
    #[serde(alias = "notes_only")]
    Minimal,
    #[serde(alias = "full_output")]
    Full,
}

/// Whether to run an associative match against the file index at execution
/// time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FreshContext {
    Enabled,
    Disabled,
}

/// Partial context-management block as found on templates and requests.
/// Absent fields inherit the next layer down (request > template > subtype
/// defaults).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextManagement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inherit_context: Option<InheritContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulate_data: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulation_format: Option<AccumulationFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fresh_context: Option<FreshContext>,
}

/// Fully resolved context settings after all overlays.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContextSettings {
    pub inherit_context: InheritContext,
    pub accumulate_data: bool,
    pub accumulation_format: AccumulationFormat,
    pub fresh_context: FreshContext,
}

impl ContextSettings {
    /// Per-subtype defaults. Unknown subtypes fall back to `standard`.
    pub fn defaults_for(subtype: &str) -> Self {
        match subtype {
            "subtask" => Self {
                inherit_context: InheritContext::None,
                accumulate_data: false,
                accumulation_format: AccumulationFormat::Minimal,
                fresh_context: FreshContext::Enabled,
            },
            "sequential" => Self {
                inherit_context: InheritContext::Full,
                accumulate_data: true,
                accumulation_format: AccumulationFormat::Minimal,
                fresh_context: FreshContext::Disabled,
            },
            "reduce" => Self {
                inherit_context: InheritContext::None,
                accumulate_data: true,
                accumulation_format: AccumulationFormat::Minimal,
                fresh_context: FreshContext::Enabled,
            },
            "script" | "script_runner" => Self {
                inherit_context: InheritContext::Full,
                accumulate_data: false,
                accumulation_format: AccumulationFormat::Minimal,
                fresh_context: FreshContext::Disabled,
            },
            "director" | "director_evaluator_loop" => Self {
                inherit_context: InheritContext::None,
                accumulate_data: true,
                accumulation_format: AccumulationFormat::Minimal,
                fresh_context: FreshContext::Enabled,
            },
            _ => Self {
                inherit_context: InheritContext::Full,
                accumulate_data: false,
                accumulation_format: AccumulationFormat::Minimal,
                fresh_context: FreshContext::Disabled,
            },
        }
    }

    /// Per-field overlay of a partial block onto these settings.
    pub fn overlay(&mut self, block: &ContextManagement) {
        if let Some(v) = block.inherit_context {
            self.inherit_context = v;
        }
        if let Some(v) = block.accumulate_data {
            self.accumulate_data = v;
        }
        if let Some(v) = block.accumulation_format {
            self.accumulation_format = v;
        }
        if let Some(v) = block.fresh_context {
            self.fresh_context = v;
        }
    }

    /// Mutual exclusivity: fresh_context=enabled requires inherit_context=none.
    pub fn validate(&self) -> std::result::Result<(), TaskError> {
        if self.fresh_context == FreshContext::Enabled
            && self.inherit_context != InheritContext::None
        {
            return Err(TaskError::failure(
                FailureReason::ContextConstraintViolation,
                format!(
                    "fresh_context=enabled requires inherit_context=none, got inherit_context={:?}",
                    self.inherit_context
                ),
            ));
        }
        Ok(())
    }

    pub fn is_empty_context(&self) -> bool {
        self.inherit_context == InheritContext::None
            && !self.accumulate_data
            && self.fresh_context == FreshContext::Disabled
    }
}

/// Handle used to invoke an atomic task programmatically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtaskRequest {
    #[serde(rename = "type", default = "atomic_type")]
    pub task_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_management: Option<ContextManagement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_hints: Option<Vec<String>>,
}

pub(crate) fn atomic_type() -> String {
    "atomic".to_string()
}

impl SubtaskRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            task_type: atomic_type(),
            name: Some(name.into()),
            subtype: None,
            inputs: Map::new(),
            file_paths: None,
            context_management: None,
            max_depth: None,
            template_hints: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn identifier(&self) -> &str {
        self.name
            .as_deref()
            .or(self.subtype.as_deref())
            .unwrap_or("")
    }

    /// Cycle-detection signature: task name plus canonicalised inputs.
    /// serde_json maps iterate in sorted key order, so the serialisation
    /// is already canonical.
    pub fn signature(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.identifier().hash(&mut hasher);
        serde_json::to_string(&self.inputs)
            .unwrap_or_default()
            .hash(&mut hasher);
        hasher.finish()
    }
}

/// What a match item carries back from the associative matcher.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchContentType {
    FileContent,
    Summary,
    FilePathOnly,
}

/// One candidate from the associative matcher. `relevance_score` is in
/// [0.0, 1.0].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchItem {
    pub id: String,
    pub content_type: MatchContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    pub relevance_score: f64,
}

/// Result of one associative-match call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AssociativeMatchResult {
    pub context_summary: String,
    pub matches: Vec<MatchItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Query handed to the associative matcher.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContextGenerationInput {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching_strategy: Option<String>,
}

impl ContextGenerationInput {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Declared output handling for an atomic task.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Text,
    Json,
}

/// Shape constraint applied to parsed JSON output.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputSchema {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "object")]
    Object,
    #[serde(rename = "array")]
    Array,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "string[]")]
    StringArray,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
}

impl OutputSchema {
    /// Shape check only; no field-level validation.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            OutputSchema::None => true,
            OutputSchema::Object => value.is_object(),
            OutputSchema::Array => value.is_array(),
            OutputSchema::String => value.is_string(),
            OutputSchema::Number => value.is_number(),
            OutputSchema::Boolean => value.is_boolean(),
            OutputSchema::StringArray => value
                .as_array()
                .map(|a| a.iter().all(|v| v.is_string()))
                .unwrap_or(false),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputFormat {
    pub kind: OutputKind,
    #[serde(default = "default_schema")]
    pub schema: OutputSchema,
}

fn default_schema() -> OutputSchema {
    OutputSchema::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_result_wire_format() {
        let result = TaskResult::failed(TaskError::failure(
            FailureReason::InputValidationFailure,
            "missing param",
        ));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["notes"]["error"]["type"], "TASK_FAILURE");
        assert_eq!(json["notes"]["error"]["reason"], "input_validation_failure");
    }

    #[test]
    fn resource_error_wire_format() {
        let err = TaskError::resource(ResourceKind::Turns, 11, 10);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "RESOURCE_EXHAUSTION");
        assert_eq!(json["reason"], "turns");
        assert_eq!(json["details"]["usage"], 11);
        assert_eq!(json["details"]["limit"], 10);
    }

    #[test]
    fn error_reason_round_trip() {
        for reason in ["turns", "context_window", "output_format_failure", "execution_halted"] {
            let parsed: ErrorReason =
                serde_json::from_value(Value::String(reason.to_string())).unwrap();
            let back = serde_json::to_value(parsed).unwrap();
            assert_eq!(back, Value::String(reason.to_string()));
        }
    }

    #[test]
    fn accumulation_format_aliases() {
        let minimal: AccumulationFormat = serde_json::from_str("\"notes_only\"").unwrap();
        assert_eq!(minimal, AccumulationFormat::Minimal);
        let full: AccumulationFormat = serde_json::from_str("\"full_output\"").unwrap();
        assert_eq!(full, AccumulationFormat::Full);
        // Canonical names emitted on output
        assert_eq!(serde_json::to_string(&minimal).unwrap(), "\"minimal\"");
    }

    #[test]
    fn context_defaults_by_subtype() {
        let standard = ContextSettings::defaults_for("standard");
        assert_eq!(standard.inherit_context, InheritContext::Full);
        assert_eq!(standard.fresh_context, FreshContext::Disabled);

        let subtask = ContextSettings::defaults_for("subtask");
        assert_eq!(subtask.inherit_context, InheritContext::None);
        assert_eq!(subtask.fresh_context, FreshContext::Enabled);

        let reduce = ContextSettings::defaults_for("reduce");
        assert!(reduce.accumulate_data);

        // Unknown subtypes behave like standard
        let custom = ContextSettings::defaults_for("my_custom_thing");
        assert_eq!(custom, standard);
    }

    #[test]
    fn context_mutual_exclusivity() {
        let mut settings = ContextSettings::defaults_for("standard");
        settings.overlay(&ContextManagement {
            fresh_context: Some(FreshContext::Enabled),
            ..Default::default()
        });
        // inherit=full + fresh=enabled violates the invariant
        let err = settings.validate().unwrap_err();
        assert_eq!(
            err.failure_reason(),
            Some(FailureReason::ContextConstraintViolation)
        );

        settings.overlay(&ContextManagement {
            inherit_context: Some(InheritContext::None),
            ..Default::default()
        });
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn subtask_signature_stable_under_key_order() {
        let mut a = SubtaskRequest::named("recurse");
        a.inputs.insert("x".into(), Value::from(1));
        a.inputs.insert("y".into(), Value::from(2));

        let mut b = SubtaskRequest::named("recurse");
        b.inputs.insert("y".into(), Value::from(2));
        b.inputs.insert("x".into(), Value::from(1));

        assert_eq!(a.signature(), b.signature());

        let c = SubtaskRequest::named("recurse").with_input("x", Value::from(3));
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn output_schema_shapes() {
        assert!(OutputSchema::Object.matches(&serde_json::json!({})));
        assert!(!OutputSchema::Object.matches(&serde_json::json!([])));
        assert!(OutputSchema::StringArray.matches(&serde_json::json!(["a", "b"])));
        assert!(!OutputSchema::StringArray.matches(&serde_json::json!(["a", 1])));
        assert!(OutputSchema::None.matches(&serde_json::json!(42)));
    }
}
