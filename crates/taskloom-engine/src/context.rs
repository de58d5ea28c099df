//! Context resolution: merge settings, resolve file paths, assemble the
//! context block handed to the handler session
//!
//! Settings merge request-over-template-over-subtype-defaults, then the
//! mutual-exclusivity invariant is enforced before any I/O happens. The
//! final context block is deterministic: explicit paths in declared
//! order, then matched paths in score-descending order, duplicates kept
//! at first occurrence.

use crate::index::{FileIndex, Matcher};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taskloom_core::{
    AccumulationFormat, ContextGenerationInput, ContextSettings, ContextSource, FailureReason,
    FilePathsSource, FreshContext, InheritContext, SubtaskRequest, TaskError, TaskResult,
    Template,
};
use taskloom_tools::{ToolOutcome, ToolRegistry};
use tracing::warn;

const COMMAND_SOURCE_TIMEOUT_SECS: u64 = 5;

/// Context the parent execution makes available to a subtask.
#[derive(Clone, Debug, Default)]
pub struct ParentContext {
    pub content: String,
    pub prior_results: Vec<TaskResult>,
}

#[derive(Clone, Debug)]
pub struct ResolvedContext {
    pub context_string: String,
    pub file_paths: Vec<PathBuf>,
    pub settings: ContextSettings,
    pub source: ContextSource,
    pub files_count: usize,
    pub empty_warning: bool,
}

pub struct ContextResolver {
    index: Arc<FileIndex>,
    matcher: Arc<dyn Matcher>,
    tools: Arc<ToolRegistry>,
    workdir: PathBuf,
}

impl ContextResolver {
    pub fn new(
        index: Arc<FileIndex>,
        matcher: Arc<dyn Matcher>,
        tools: Arc<ToolRegistry>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            index,
            matcher,
            tools,
            workdir,
        }
    }

    pub async fn resolve(
        &self,
        template: &Template,
        request: &SubtaskRequest,
        parent: Option<&ParentContext>,
    ) -> Result<ResolvedContext, TaskError> {
        let subtype = request.subtype.as_deref().unwrap_or(&template.subtype);
        let mut settings = ContextSettings::defaults_for(subtype);
        if let Some(block) = &template.context_management {
            settings.overlay(block);
        }
        if let Some(block) = &request.context_management {
            settings.overlay(block);
        }
        // Enforced before any I/O.
        settings.validate()?;

        let mut source = ContextSource::None;

        // Explicit request paths win; otherwise the template decides.
        let explicit: Vec<PathBuf> = match &request.file_paths {
            Some(paths) if !paths.is_empty() => {
                source = ContextSource::Explicit;
                paths.clone()
            }
            _ => {
                let from_template = self.template_paths(template).await?;
                if !from_template.is_empty() {
                    source = ContextSource::Template;
                }
                from_template
            }
        };

        let mut matched: Vec<PathBuf> = Vec::new();
        if settings.fresh_context == FreshContext::Enabled {
            matched = self
                .fresh_match(template, request, parent, settings.inherit_context)
                .await?;
            if source == ContextSource::None && !matched.is_empty() {
                source = ContextSource::Automatic;
            }
        }

        let inherited = self.inherited_content(settings.inherit_context, parent, &matched);
        if source == ContextSource::None && inherited.is_some() {
            source = ContextSource::Inherited;
        }

        // Dedup keeping first occurrence: explicit paths first in declared
        // order, then matched paths in score order.
        let mut seen = HashSet::new();
        let ordered: Vec<PathBuf> = explicit
            .into_iter()
            .chain(matched)
            .filter(|p| seen.insert(p.clone()))
            .collect();

        let mut sections: Vec<String> = Vec::new();
        if let Some(inherited) = inherited {
            sections.push(inherited);
        }
        if settings.accumulate_data {
            if let Some(parent) = parent {
                if let Some(accumulated) =
                    render_accumulated(&parent.prior_results, settings.accumulation_format)
                {
                    sections.push(accumulated);
                }
            }
        }
        for path in &ordered {
            sections.push(self.render_file(path).await);
        }

        let empty_warning = settings.is_empty_context() && ordered.is_empty();
        if empty_warning {
            warn!(
                "EMPTY_CONTEXT: task '{}' runs with no inherited, accumulated, or fresh context",
                template.name
            );
        }

        Ok(ResolvedContext {
            context_string: sections.join("\n\n"),
            files_count: ordered.len(),
            file_paths: ordered,
            settings,
            source,
            empty_warning,
        })
    }

    async fn template_paths(&self, template: &Template) -> Result<Vec<PathBuf>, TaskError> {
        if let Some(paths) = &template.file_paths {
            return Ok(paths.clone());
        }
        match &template.file_paths_source {
            None => Ok(Vec::new()),
            Some(FilePathsSource::Literal(paths)) => Ok(paths.clone()),
            Some(FilePathsSource::Command(script)) => self.paths_from_command(script).await,
            Some(FilePathsSource::Description(query)) => {
                let result = self
                    .matcher
                    .find_matches(&ContextGenerationInput::query(query.clone()), &self.index)
                    .await;
                if let Some(error) = result.error {
                    return Err(TaskError::failure(
                        FailureReason::ContextMatchingFailure,
                        error,
                    ));
                }
                Ok(result
                    .matches
                    .into_iter()
                    .filter_map(|m| m.source_path)
                    .collect())
            }
        }
    }

    /// Run a `command` file-paths source through the shell runner: one
    /// path per stdout line, keeping only existing absolute paths.
    async fn paths_from_command(&self, script: &str) -> Result<Vec<PathBuf>, TaskError> {
        let outcome = self
            .tools
            .execute(
                "system:run_script",
                json!({ "script": script, "timeout_secs": COMMAND_SOURCE_TIMEOUT_SECS }),
            )
            .await;
        let stdout = match outcome {
            ToolOutcome::Error(message) => {
                return Err(TaskError::failure(
                    FailureReason::ContextRetrievalFailure,
                    format!("file_paths command failed: {}", message),
                ))
            }
            other => other.to_content_string(),
        };

        let mut paths = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let path = Path::new(line);
            if path.is_absolute() && tokio::fs::metadata(path).await.is_ok() {
                paths.push(path.to_path_buf());
            }
        }
        Ok(paths)
    }

    async fn fresh_match(
        &self,
        template: &Template,
        request: &SubtaskRequest,
        parent: Option<&ParentContext>,
        inherit: InheritContext,
    ) -> Result<Vec<PathBuf>, TaskError> {
        let mut input = ContextGenerationInput::query(
            template
                .description
                .clone()
                .unwrap_or_else(|| template.name.clone()),
        );
        input.inputs = request.inputs.clone();
        if inherit == InheritContext::Subset {
            if let Some(parent) = parent {
                input.history = Some(parent.content.clone());
            }
        }

        let result = self.matcher.find_matches(&input, &self.index).await;
        if let Some(error) = result.error {
            return Err(TaskError::failure(
                FailureReason::ContextMatchingFailure,
                error,
            ));
        }
        Ok(result
            .matches
            .into_iter()
            .filter_map(|m| m.source_path)
            .collect())
    }

    /// Full inheritance passes the parent block through; subset keeps only
    /// the lines that reference a matched path.
    fn inherited_content(
        &self,
        inherit: InheritContext,
        parent: Option<&ParentContext>,
        matched: &[PathBuf],
    ) -> Option<String> {
        let parent = parent.filter(|p| !p.content.is_empty())?;
        match inherit {
            InheritContext::None => None,
            InheritContext::Full => Some(parent.content.clone()),
            InheritContext::Subset => {
                let needles: Vec<String> =
                    matched.iter().map(|p| p.display().to_string()).collect();
                if needles.is_empty() {
                    return None;
                }
                let kept: Vec<&str> = parent
                    .content
                    .lines()
                    .filter(|line| needles.iter().any(|n| line.contains(n.as_str())))
                    .collect();
                if kept.is_empty() {
                    None
                } else {
                    Some(kept.join("\n"))
                }
            }
        }
    }

    /// Unreadable files are kept inline with an error marker, never
    /// silently dropped.
    async fn render_file(&self, path: &Path) -> String {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => format!(
                "<<<FILE path=\"{}\">>>\n{}\n<<<END>>>",
                path.display(),
                content.trim_end()
            ),
            Err(e) => format!("<<<FILE path=\"{}\" error=\"{}\">>>", path.display(), e),
        }
    }
}

fn render_accumulated(
    prior: &[TaskResult],
    format: AccumulationFormat,
) -> Option<String> {
    if prior.is_empty() {
        return None;
    }
    let mut lines = vec!["Prior step outputs:".to_string()];
    for (i, result) in prior.iter().enumerate() {
        match format {
            AccumulationFormat::Minimal => {
                let label = result
                    .notes
                    .template_used
                    .as_deref()
                    .unwrap_or("(unnamed)");
                lines.push(format!("- step {}: {} {:?}", i + 1, label, result.status));
            }
            AccumulationFormat::Full => {
                lines.push(format!(
                    "- step {} ({:?}):\n{}",
                    i + 1,
                    result.status,
                    result.content
                ));
            }
        }
    }
    Some(lines.join("\n"))
}
