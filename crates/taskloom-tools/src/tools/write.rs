//! Write tool — write a string to a file, creating parent directories

use crate::registry::{Tool, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

pub struct WriteFileTool {
    workspace_root: PathBuf,
}

impl WriteFileTool {
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
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, replacing it if it exists. \
         Parent directories are created as needed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["path", "content"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file to write"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let path = match args["path"].as_str() {
            Some(p) => self.resolve_path(p),
            None => return ToolOutcome::error("Missing required parameter: path"),
        };
        let content = match args["content"].as_str() {
            Some(c) => c,
            None => return ToolOutcome::error("Missing required parameter: content"),
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolOutcome::error(format!(
                    "Cannot create {}: {}",
                    parent.display(),
                    e
                ));
            }
        }

        match fs::write(&path, content).await {
            Ok(()) => ToolOutcome::text(format!(
                "Wrote {} bytes to {}",
                content.len(),
                path.display()
            )),
            Err(e) => ToolOutcome::error(format!("Cannot write {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());

        let outcome = tool
            .execute(json!({"path": "nested/out.txt", "content": "data"}))
            .await;
        assert!(!outcome.is_error(), "{}", outcome.to_content_string());
        let written = std::fs::read_to_string(dir.path().join("nested/out.txt")).unwrap();
        assert_eq!(written, "data");
    }

    #[tokio::test]
    async fn missing_content_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = WriteFileTool::new(dir.path());
        let outcome = tool.execute(json!({"path": "x.txt"})).await;
        assert!(outcome.is_error());
    }
}
