use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_str, Tool, ToolContext, ToolOutcome};

const DEFAULT_LIMIT: usize = 2000;
const MAX_LINE_LEN: usize = 2000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents with line numbers. Use `offset` (1-indexed) and \
         `limit` for large files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Start reading from this line number (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 2000)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let raw_path = require_str(&args, "path")?;
        let path = match ctx.confine(raw_path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutcome::failure(e.to_string())),
        };

        if !path.exists() {
            return Ok(ToolOutcome::failure(format!("file not found: {raw_path}")));
        }

        let bytes = tokio::fs::read(&path).await?;
        if bytes[..bytes.len().min(512)].contains(&0) {
            return Ok(ToolOutcome::failure(format!(
                "binary file ({} bytes): {raw_path}",
                bytes.len()
            )));
        }

        let content = String::from_utf8_lossy(&bytes);
        let all_lines: Vec<&str> = content.lines().collect();
        let total = all_lines.len();

        let offset = args
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|v| v.saturating_sub(1) as usize)
            .unwrap_or(0);
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_LIMIT);

        let end = (offset + limit).min(total);
        let mut output = String::new();
        for (i, line) in all_lines[offset.min(total)..end].iter().enumerate() {
            let display = if line.len() > MAX_LINE_LEN {
                &line[..MAX_LINE_LEN]
            } else {
                line
            };
            output.push_str(&format!("{:6}|{display}\n", offset + i + 1));
        }

        Ok(ToolOutcome::success(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_with_line_numbers_and_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma\n").unwrap();
        let ctx = ToolContext::new(dir.path());

        let out = ReadFileTool
            .execute(json!({"path": "f.txt", "offset": 2, "limit": 1}), &ctx)
            .await
            .unwrap();
        assert!(out.ok);
        assert_eq!(out.content, "     2|beta\n");
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_failure_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let out = ReadFileTool
            .execute(json!({"path": "nope.txt"}), &ctx)
            .await
            .unwrap();
        assert!(!out.ok);
        assert!(out.content.contains("not found"));
    }

    #[tokio::test]
    async fn escape_attempt_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let out = ReadFileTool
            .execute(json!({"path": "../../etc/passwd"}), &ctx)
            .await
            .unwrap();
        assert!(!out.ok);
        assert!(out.content.contains("escapes"));
    }
}
