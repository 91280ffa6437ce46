use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext, ToolOutcome};

const MAX_ENTRIES: usize = 500;

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in the working directory. Pass `path` for a subdirectory or \
         `pattern` for a glob like `src/**/*.rs`."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: workspace root)"
                },
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern relative to the workspace root"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        if let Some(pattern) = args.get("pattern").and_then(|v| v.as_str()) {
            return glob_files(pattern, ctx);
        }

        let raw_path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let dir = match ctx.confine(raw_path) {
            Ok(p) => p,
            Err(e) => return Ok(ToolOutcome::failure(e.to_string())),
        };

        if !dir.is_dir() {
            return Ok(ToolOutcome::failure(format!("not a directory: {raw_path}")));
        }

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let suffix = if entry.path().is_dir() { "/" } else { "" };
            entries.push(format!("{name}{suffix}"));
        }
        entries.sort();
        entries.truncate(MAX_ENTRIES);

        Ok(ToolOutcome::success(entries.join("\n")))
    }
}

fn glob_files(pattern: &str, ctx: &ToolContext) -> Result<ToolOutcome> {
    if pattern.contains("..") || pattern.starts_with('/') {
        return Ok(ToolOutcome::failure(format!(
            "pattern escapes the working directory: {pattern}"
        )));
    }

    let full = ctx.workspace_root.join(pattern);
    let Some(full_str) = full.to_str() else {
        return Ok(ToolOutcome::failure("pattern is not valid UTF-8".to_string()));
    };

    let mut matches = Vec::new();
    for entry in glob::glob(full_str)? {
        let Ok(path) = entry else { continue };
        if let Ok(rel) = path.strip_prefix(&ctx.workspace_root) {
            matches.push(rel.display().to_string());
        }
        if matches.len() >= MAX_ENTRIES {
            break;
        }
    }
    matches.sort();

    if matches.is_empty() {
        return Ok(ToolOutcome::success(format!("no matches for {pattern}")));
    }
    Ok(ToolOutcome::success(matches.join("\n")))
}
