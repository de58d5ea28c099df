//! Shell runner — execute a script with timeout and cancellation
//!
//! Registered as `system:run_script`, the same name the S-expression
//! primitive uses. Also backs `command` file-path sources in the context
//! resolver, which rely on the 5-second default timeout.

use crate::registry::{Tool, ToolOutcome};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const MAX_TIMEOUT_SECS: u64 = 600;

pub struct RunScriptTool {
    workspace_root: PathBuf,
}

impl RunScriptTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl Tool for RunScriptTool {
    fn name(&self) -> &str {
        "system:run_script"
    }

    fn description(&self) -> &str {
        "Execute a shell script and capture stdout and stderr. \
         Set timeout_secs to override the 5 second default."
    }

    fn prompt(&self) -> &str {
        "Use system:run_script for shell operations. Quote paths with spaces."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["script"],
            "properties": {
                "script": {
                    "type": "string",
                    "description": "The shell script to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 5, max 600)"
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let script = match args["script"].as_str() {
            Some(s) => s,
            None => return ToolOutcome::error("Missing required parameter: script"),
        };

        let timeout_secs = args["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        debug!("run_script: {}", &script[..script.len().min(80)]);

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            Command::new("sh")
                .arg("-c")
                .arg(script)
                .current_dir(&self.workspace_root)
                .output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolOutcome::error(format!("Failed to execute: {}", e)),
            Err(_) => {
                return ToolOutcome::error(format!("Script timed out after {}s", timeout_secs))
            }
        };

        render_outcome(
            output.status.success(),
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
    }

    /// Cancellable execution: spawns the process with kill_on_drop(true)
    /// and races against the CancellationToken.
    async fn execute_cancellable(&self, args: Value, cancel: CancellationToken) -> ToolOutcome {
        let script = match args["script"].as_str() {
            Some(s) => s.to_string(),
            None => return ToolOutcome::error("Missing required parameter: script"),
        };

        let timeout_secs = args["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&script)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolOutcome::error(format!("Failed to spawn: {}", e)),
        };

        let timeout = std::time::Duration::from_secs(timeout_secs);

        tokio::select! {
            result = tokio::time::timeout(timeout, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = drain(child.stdout.take()).await;
                        let stderr = drain(child.stderr.take()).await;
                        render_outcome(status.success(), status.code(), &stdout, &stderr)
                    }
                    Ok(Err(e)) => ToolOutcome::error(format!("Failed to wait: {}", e)),
                    Err(_) => {
                        let _ = child.kill().await;
                        ToolOutcome::error(format!("Script timed out after {}s", timeout_secs))
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                ToolOutcome::text("[script killed by cancellation]")
            }
        }
    }
}

/// Drain what the exited child left in a pipe. Non-UTF-8 bytes are
/// replaced rather than dropped.
async fn drain(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut bytes).await;
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

const MAX_OUTPUT_CHARS: usize = 30_000;

/// Turn an exited script's streams into a tool outcome. Failures carry
/// both streams in the error message; successes interleave stderr after
/// stdout and are capped at MAX_OUTPUT_CHARS.
fn render_outcome(success: bool, code: Option<i32>, stdout: &str, stderr: &str) -> ToolOutcome {
    let stdout = stdout.trim_end();
    let stderr = stderr.trim_end();

    if !success {
        let mut message = match code {
            Some(code) => format!("script exited with code {}", code),
            None => "script terminated by signal".to_string(),
        };
        for stream in [stdout, stderr] {
            if !stream.is_empty() {
                message.push('\n');
                message.push_str(stream);
            }
        }
        return ToolOutcome::error(message);
    }

    let mut text = stdout.to_string();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr);
    }

    if text.is_empty() {
        return ToolOutcome::text("(no output)");
    }
    if text.len() > MAX_OUTPUT_CHARS {
        let total = text.len();
        let mut cut = MAX_OUTPUT_CHARS;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str(&format!("\n[output capped at {} of {} chars]", cut, total));
    }
    ToolOutcome::text(text)
}
