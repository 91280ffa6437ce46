use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{require_str, Tool, ToolContext, ToolOutcome};

const MAX_OUTPUT_BYTES: usize = 100 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 120;

pub struct RunShellTool;

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the working directory and return its output and \
         exit code. Use `timeout` to set a limit in seconds (default 30, max 120)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 120)"
                }
            },
            "required": ["command"]
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let command = require_str(&args, "command")?;
        let timeout_secs = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        // The tool-level deadline, if sooner, wins over the requested timeout.
        let mut limit = Duration::from_secs(timeout_secs);
        if let Some(deadline) = ctx.deadline {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            limit = limit.min(remaining);
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes are drained concurrently so neither can block the child.
        let waited = tokio::time::timeout(limit, async {
            let (out, err) = tokio::try_join!(drain(stdout), drain(stderr))?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((out, err, status))
        })
        .await;

        match waited {
            Ok(Ok((out, err, status))) => {
                let exit_code = status.code().unwrap_or(-1);
                let mut combined = String::from_utf8_lossy(&out).into_owned();
                let stderr_text = String::from_utf8_lossy(&err);
                if !stderr_text.is_empty() {
                    if !combined.is_empty() {
                        combined.push('\n');
                    }
                    combined.push_str(&stderr_text);
                }
                if combined.len() > MAX_OUTPUT_BYTES {
                    combined.truncate(MAX_OUTPUT_BYTES);
                    combined.push_str("\n... (output truncated)");
                }
                if combined.is_empty() {
                    combined.push_str("(no output)");
                }

                if exit_code == 0 {
                    Ok(ToolOutcome::success(combined))
                } else {
                    Ok(ToolOutcome::failure(format!(
                        "exit code {exit_code}\n{combined}"
                    )))
                }
            }
            Ok(Err(e)) => Ok(ToolOutcome::failure(format!("command failed: {e}"))),
            Err(_) => Ok(ToolOutcome::failure(format!(
                "command timed out after {}s",
                limit.as_secs()
            ))),
        }
    }
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        tokio::io::AsyncReadExt::read_to_end(&mut pipe, &mut buf).await?;
    }
    Ok(buf)
}
