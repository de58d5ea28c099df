//! Read tool — return file contents as a string

use crate::registry::{Tool, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

const MAX_BYTES: usize = 256 * 1024;

pub struct ReadFileTool {
    workspace_root: PathBuf,
}

impl ReadFileTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace_root.join(p)
        }
    }
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Relative paths resolve against the workspace root."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to read"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let path = match args["path"].as_str() {
            Some(p) => self.resolve_path(p),
            None => return ToolOutcome::error("Missing required parameter: path"),
        };

        match fs::read_to_string(&path).await {
            Ok(content) if content.len() > MAX_BYTES => ToolOutcome::text(format!(
                "{}\n... [truncated, {} total bytes]",
                &content[..MAX_BYTES],
                content.len()
            )),
            Ok(content) => ToolOutcome::text(content),
            Err(e) => ToolOutcome::error(format!("Cannot read {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_relative_to_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "contents here").unwrap();

        let tool = ReadFileTool::new(dir.path());
        let outcome = tool.execute(json!({"path": "note.txt"})).await;
        assert_eq!(outcome.to_content_string(), "contents here");
    }

    #[tokio::test]
    async fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(dir.path());
        let outcome = tool.execute(json!({"path": "absent.txt"})).await;
        assert!(outcome.is_error());
    }
}
