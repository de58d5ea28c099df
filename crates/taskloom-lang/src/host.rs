//! The seam between the workflow language and the execution engine
//!
//! The evaluator reaches tasks, tools, templates, and the associative
//! matcher only through this trait. The engine crate implements it; tests
//! use small stub hosts.

use serde_json::Value as Json;
use taskloom_core::{
    AssociativeMatchResult, ContextGenerationInput, SubtaskRequest, TaskResult, Template,
};

#[async_trait::async_trait]
pub trait WorkflowHost: Send + Sync {
    /// Execute an atomic task to a terminal result. CONTINUATION folding,
    /// depth limits, and cycle detection happen behind this call; the
    /// returned result is COMPLETE or FAILED.
    async fn execute_task(&self, request: SubtaskRequest) -> TaskResult;

    /// Execute a direct tool by name.
    async fn execute_tool(&self, name: &str, args: Json) -> TaskResult;

    /// Register a template produced by `defatom`. On failure, returns a
    /// message listing the offending fields.
    fn register_template(&self, template: Template) -> Result<(), String>;

    fn template_exists(&self, name: &str) -> bool;

    /// Declared parameter order, for positional argument binding.
    fn template_params(&self, name: &str) -> Option<Vec<String>>;

    fn tool_exists(&self, name: &str) -> bool;

    /// Associative match against the global file index.
    async fn match_context(&self, input: ContextGenerationInput) -> AssociativeMatchResult;
}
