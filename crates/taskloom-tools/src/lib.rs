//! Taskloom Tools — modular tool implementations
//!
//! Each tool is a self-contained file in src/tools/.
//! To add a tool: create the file, implement Tool trait, register below.

pub mod registry;
pub mod tools;

pub use registry::{Tool, ToolOutcome, ToolRegistry};

use std::path::Path;

/// Create the default tool registry with all builtin tools.
///
/// Edit this function to add or remove tools from the runtime.
pub fn create_default_registry(workspace_root: impl AsRef<Path>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    // --- Direct tools ---
    registry.register(tools::read::ReadFileTool::new(root));
    registry.register(tools::write::WriteFileTool::new(root));
    registry.register(tools::shell::RunScriptTool::new(root));

    // --- Subtask spawning ---
    registry.register(tools::spawn_task::SpawnTaskTool::new());

    registry
}
