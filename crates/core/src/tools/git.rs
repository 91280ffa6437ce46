use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{Tool, ToolContext, ToolOutcome};

const MAX_OUTPUT_BYTES: usize = 50 * 1024;

pub(crate) async fn run_git(args: &[&str], cwd: &Path) -> Result<(String, i32)> {
    let output = Command::new("git").args(args).current_dir(cwd).output().await?;

    let exit_code = output.status.code().unwrap_or(-1);
    let mut out = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() && exit_code != 0 {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&stderr);
    }
    if out.len() > MAX_OUTPUT_BYTES {
        out.truncate(MAX_OUTPUT_BYTES);
        out.push_str("\n... (output truncated)");
    }
    Ok((out, exit_code))
}

pub struct GitLogTool;

#[async_trait]
impl Tool for GitLogTool {
    fn name(&self) -> &str {
        "git_log"
    }

    fn description(&self) -> &str {
        "Show recent commit history. Pass `limit` to change the number of \
         commits (default 20) or `path` to restrict to a file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "description": "Number of commits to show (default 20)"
                },
                "path": {
                    "type": "string",
                    "description": "Restrict the log to this file"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(20);
        let limit_arg = format!("-{limit}");
        let mut git_args = vec!["log", "--oneline", "--no-color", &limit_arg];

        let confined;
        if let Some(raw) = args.get("path").and_then(|v| v.as_str()) {
            confined = match ctx.confine(raw) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutcome::failure(e.to_string())),
            };
            git_args.push("--");
            git_args.push(confined.to_str().unwrap_or(raw));
        }

        let (out, code) = run_git(&git_args, &ctx.workspace_root).await?;
        if code != 0 {
            return Ok(ToolOutcome::failure(format!("git log failed:\n{out}")));
        }
        Ok(ToolOutcome::success(if out.is_empty() {
            "(no commits)".to_string()
        } else {
            out
        }))
    }
}

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }

    fn description(&self) -> &str {
        "Show uncommitted changes as a unified diff. Pass `staged: true` for \
         the index, or `path` to restrict to a file."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "staged": {
                    "type": "boolean",
                    "description": "Diff the index instead of the working tree"
                },
                "path": {
                    "type": "string",
                    "description": "Restrict the diff to this file"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let mut git_args = vec!["diff", "--no-color"];
        if args.get("staged").and_then(|v| v.as_bool()).unwrap_or(false) {
            git_args.push("--cached");
        }

        let confined;
        if let Some(raw) = args.get("path").and_then(|v| v.as_str()) {
            confined = match ctx.confine(raw) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutcome::failure(e.to_string())),
            };
            git_args.push("--");
            git_args.push(confined.to_str().unwrap_or(raw));
        }

        let (out, code) = run_git(&git_args, &ctx.workspace_root).await?;
        if code != 0 {
            return Ok(ToolOutcome::failure(format!("git diff failed:\n{out}")));
        }
        Ok(ToolOutcome::success(if out.is_empty() {
            "(no changes)".to_string()
        } else {
            out
        }))
    }
}

/// Working-tree diff used by the review layer; empty string when not a git
/// repository or nothing changed.
pub async fn working_tree_diff(root: &Path) -> String {
    match run_git(&["diff", "--no-color"], root).await {
        Ok((out, 0)) => out,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "t"],
        ] {
            run_git(&args, dir).await.unwrap();
        }
    }

    #[tokio::test]
    async fn log_and_diff_against_a_real_repo() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        run_git(&["add", "."], dir.path()).await.unwrap();
        run_git(&["commit", "-q", "-m", "add a.txt"], dir.path())
            .await
            .unwrap();

        let ctx = ToolContext::new(dir.path());
        let log = GitLogTool.execute(json!({}), &ctx).await.unwrap();
        assert!(log.ok);
        assert!(log.content.contains("add a.txt"));

        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        let diff = GitDiffTool.execute(json!({}), &ctx).await.unwrap();
        assert!(diff.ok);
        assert!(diff.content.contains("-one"));
        assert!(diff.content.contains("+two"));
    }

    #[tokio::test]
    async fn outside_a_repo_is_a_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let out = GitLogTool.execute(json!({}), &ctx).await.unwrap();
        assert!(!out.ok);
    }
}
