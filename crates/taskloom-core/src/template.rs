//! Atomic task templates and registration-time validation

use crate::types::{ContextManagement, ContextSettings, OutputFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

/// How a template discovers its default file paths when the request does
/// not supply any.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FilePathsSource {
    /// Fixed list of paths.
    Literal(Vec<PathBuf>),
    /// Shell command printing one path per line on stdout.
    Command(String),
    /// Query string for the associative matcher.
    Description(String),
}

/// A parameterised atomic task definition. Immutable once registered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(rename = "type", default = "crate::types::atomic_type")]
    pub task_type: String,
    #[serde(default = "default_subtype")]
    pub subtype: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub param_types: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_management: Option<ContextManagement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_paths_source: Option<FilePathsSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
    /// Wall-clock bound on one execution of this task. Unbounded when
    /// absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

fn default_subtype() -> String {
    "standard".to_string()
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap())
}

impl Template {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: "atomic".to_string(),
            subtype: default_subtype(),
            params: Vec::new(),
            param_types: Map::new(),
            description: None,
            instructions: instructions.into(),
            system: None,
            model: None,
            context_management: None,
            file_paths: None,
            file_paths_source: None,
            output_format: None,
            returns: None,
            max_duration_secs: None,
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = subtype.into();
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    /// Secondary registry key.
    pub fn subtype_key(&self) -> String {
        format!("{}:{}", self.task_type, self.subtype)
    }

    /// All `{{X}}` placeholder names appearing in any text field.
    pub fn placeholders(&self) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut scan = |text: &str| {
            for cap in placeholder_re().captures_iter(text) {
                found.insert(cap[1].to_string());
            }
        };
        scan(&self.instructions);
        if let Some(system) = &self.system {
            scan(system);
        }
        if let Some(description) = &self.description {
            scan(description);
        }
        found
    }

    /// Registration-time validation. Returns every offending field rather
    /// than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.task_type != "atomic" {
            problems.push(format!("type must be 'atomic', got '{}'", self.task_type));
        }
        if self.name.trim().is_empty() {
            problems.push("name must be non-empty".to_string());
        }

        let declared: HashSet<&str> = self.params.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        for param in &self.params {
            if !seen.insert(param.as_str()) {
                problems.push(format!("duplicate parameter '{}'", param));
            }
        }
        let mut unknown: Vec<String> = self
            .placeholders()
            .into_iter()
            .filter(|p| !declared.contains(p.as_str()))
            .collect();
        unknown.sort();
        for placeholder in unknown {
            problems.push(format!(
                "placeholder '{{{{{}}}}}' does not reference a declared parameter",
                placeholder
            ));
        }

        if self.file_paths.is_some() && self.file_paths_source.is_some() {
            problems.push("file_paths and file_paths_source are mutually exclusive".to_string());
        }

        if let Some(block) = &self.context_management {
            let mut settings = ContextSettings::defaults_for(&self.subtype);
            settings.overlay(block);
            if let Err(e) = settings.validate() {
                problems.push(format!("context_management: {}", e.message));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }
}

/// Substitute `{{param}}` placeholders in one text field. The substitution
/// environment is exactly `params`; anything else is unreachable.
pub fn substitute_placeholders(
    text: &str,
    params: &Map<String, Value>,
) -> Result<String, String> {
    let mut missing = Vec::new();
    let substituted = placeholder_re().replace_all(text, |cap: &regex::Captures<'_>| {
        let key = &cap[1];
        match params.get(key) {
            Some(value) => value_to_plain_string(value),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(substituted.into_owned())
    } else {
        missing.sort();
        missing.dedup();
        Err(format!("unknown placeholders: {}", missing.join(", ")))
    }
}

/// Render a JSON value the way `str()` would: strings without quotes,
/// everything else as compact JSON.
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_scan_covers_all_text_fields() {
        let template = Template::new("t", "Say {{x}}")
            .with_system("Focus on {{topic}}")
            .with_description("About {{topic}} and {{x}}");
        let found = template.placeholders();
        assert!(found.contains("x"));
        assert!(found.contains("topic"));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn validate_accepts_declared_placeholders() {
        let template = Template::new("echo", "Say: {{x}}").with_params(["x"]);
        assert!(template.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_placeholder() {
        let template = Template::new("broken", "{{y}}").with_params(["x"]);
        let problems = template.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("y")), "{:?}", problems);
    }

    #[test]
    fn validate_rejects_non_atomic_type() {
        let mut template = Template::new("t", "body");
        template.task_type = "composite".to_string();
        let problems = template.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("atomic")));
    }

    #[test]
    fn validate_rejects_conflicting_context_defaults() {
        let mut template = Template::new("t", "body");
        template.context_management = Some(ContextManagement {
            inherit_context: Some(crate::types::InheritContext::Full),
            fresh_context: Some(crate::types::FreshContext::Enabled),
            ..Default::default()
        });
        let problems = template.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("context_management")));
    }

    #[test]
    fn validate_collects_multiple_problems() {
        let mut template = Template::new("", "{{a}} {{b}}");
        template.task_type = "weird".to_string();
        let problems = template.validate().unwrap_err();
        assert!(problems.len() >= 4, "{:?}", problems);
    }

    #[test]
    fn substitution_uses_only_params() {
        let mut params = Map::new();
        params.insert("x".to_string(), Value::String("hello".to_string()));
        let out = substitute_placeholders("Say: {{x}}", &params).unwrap();
        assert_eq!(out, "Say: hello");
        assert!(!out.contains("{{"));
    }

    #[test]
    fn substitution_fails_on_unknown_placeholder() {
        let params = Map::new();
        let err = substitute_placeholders("{{y}}", &params).unwrap_err();
        assert!(err.contains("y"));
    }

    #[test]
    fn substitution_stringifies_non_string_values() {
        let mut params = Map::new();
        params.insert("n".to_string(), Value::from(42));
        params.insert("flag".to_string(), Value::from(true));
        let out = substitute_placeholders("{{n}} {{flag}}", &params).unwrap();
        assert_eq!(out, "42 true");
    }

    #[test]
    fn template_toml_round_trip() {
        let toml_src = r#"
            name = "summarise"
            params = ["path"]
            description = "Summarise one file"
            instructions = "Summarise the file at {{path}}."

            [context_management]
            fresh_context = "disabled"
        "#;
        let template: Template = toml::from_str(toml_src).unwrap();
        assert_eq!(template.name, "summarise");
        assert_eq!(template.task_type, "atomic");
        assert_eq!(template.subtype, "standard");
        assert!(template.validate().is_ok());
    }
}
