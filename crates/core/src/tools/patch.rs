use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{require_str, Tool, ToolContext, ToolOutcome};

pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff patch. All hunks must apply or the whole patch is \
         rolled back. Use for multi-file changes expressed as `git diff` output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "Unified diff (output of `diff -u` or `git diff`)"
                }
            },
            "required": ["patch"]
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let patch = require_str(&args, "patch")?;

        let files = match parse_unified_diff(patch) {
            Ok(files) if files.is_empty() => {
                return Ok(ToolOutcome::failure("no hunks found in patch".to_string()))
            }
            Ok(files) => files,
            Err(e) => return Ok(ToolOutcome::failure(format!("unparseable patch: {e}"))),
        };

        // Snapshot originals first so any failure can restore all of them.
        let mut backups: HashMap<PathBuf, Option<String>> = HashMap::new();
        for file in &files {
            let path = match ctx.confine(&file.target) {
                Ok(p) => p,
                Err(e) => return Ok(ToolOutcome::failure(e.to_string())),
            };
            if !backups.contains_key(&path) {
                let original = if path.exists() {
                    Some(tokio::fs::read_to_string(&path).await?)
                } else {
                    None
                };
                backups.insert(path, original);
            }
        }

        let mut applied_hunks = 0;
        let mut changed = Vec::new();

        for file in &files {
            let path = ctx.confine(&file.target)?;
            let original = backups[&path].clone().unwrap_or_default();

            match apply_hunks(&original, &file.hunks) {
                Ok(updated) => {
                    if let Some(parent) = path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&path, &updated).await?;
                    applied_hunks += file.hunks.len();
                    changed.push(file.target.clone());
                }
                Err(e) => {
                    for (path, backup) in &backups {
                        match backup {
                            Some(content) => {
                                let _ = tokio::fs::write(path, content).await;
                            }
                            None => {
                                let _ = tokio::fs::remove_file(path).await;
                            }
                        }
                    }
                    return Ok(ToolOutcome::failure(format!(
                        "patch failed at {} and was rolled back: {e}",
                        file.target
                    )));
                }
            }
        }

        Ok(ToolOutcome::success(format!(
            "applied {applied_hunks} hunks across {} files: {}",
            changed.len(),
            changed.join(", ")
        )))
    }
}

struct FilePatch {
    target: String,
    hunks: Vec<Hunk>,
}

struct Hunk {
    old_start: usize,
    old_lines: Vec<String>,
    new_lines: Vec<String>,
}

fn parse_unified_diff(patch: &str) -> Result<Vec<FilePatch>> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut current_file: Option<FilePatch> = None;
    let mut current_hunk: Option<Hunk> = None;

    fn flush_hunk(file: &mut Option<FilePatch>, hunk: Option<Hunk>) {
        if let (Some(f), Some(h)) = (file.as_mut(), hunk) {
            f.hunks.push(h);
        }
    }

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            flush_hunk(&mut current_file, current_hunk.take());
            if let Some(f) = current_file.take() {
                if !f.hunks.is_empty() {
                    files.push(f);
                }
            }
            let target = rest.trim();
            let target = target.strip_prefix("b/").unwrap_or(target);
            current_file = Some(FilePatch {
                target: target.to_string(),
                hunks: Vec::new(),
            });
        } else if line.starts_with("--- ") || line.starts_with("diff ") || line.starts_with("index ")
        {
            continue;
        } else if line.starts_with("@@ ") {
            flush_hunk(&mut current_file, current_hunk.take());
            let old_start = parse_hunk_header(line)
                .ok_or_else(|| anyhow::anyhow!("bad hunk header: {line}"))?;
            current_hunk = Some(Hunk {
                old_start,
                old_lines: Vec::new(),
                new_lines: Vec::new(),
            });
        } else if let Some(hunk) = current_hunk.as_mut() {
            if let Some(removed) = line.strip_prefix('-') {
                hunk.old_lines.push(removed.to_string());
            } else if let Some(added) = line.strip_prefix('+') {
                hunk.new_lines.push(added.to_string());
            } else {
                let context = line.strip_prefix(' ').unwrap_or(line);
                hunk.old_lines.push(context.to_string());
                hunk.new_lines.push(context.to_string());
            }
        }
    }

    flush_hunk(&mut current_file, current_hunk.take());
    if let Some(f) = current_file {
        if !f.hunks.is_empty() {
            files.push(f);
        }
    }

    Ok(files)
}

fn parse_hunk_header(header: &str) -> Option<usize> {
    let after = header.strip_prefix("@@ -")?;
    after.split([',', ' ']).next()?.parse().ok()
}

fn apply_hunks(content: &str, hunks: &[Hunk]) -> Result<String> {
    let mut lines: Vec<String> = content.lines().map(String::from).collect();
    let mut offset: isize = 0;

    for hunk in hunks {
        // `-0,0` marks a pure insertion (new file); there is no line 0.
        let start = if hunk.old_start == 0 {
            offset
        } else {
            hunk.old_start as isize - 1 + offset
        };
        if start < 0 || start as usize > lines.len() {
            anyhow::bail!("hunk start {} out of range", hunk.old_start);
        }
        let start = start as usize;
        let end = (start + hunk.old_lines.len()).min(lines.len());

        // The hunk's old side must match the file; otherwise the patch is
        // stale and the caller rolls back.
        let existing = &lines[start..end];
        if existing.len() != hunk.old_lines.len()
            || existing.iter().zip(&hunk.old_lines).any(|(a, b)| a != b)
        {
            anyhow::bail!("hunk at line {} does not match file content", hunk.old_start);
        }

        lines.splice(start..end, hunk.new_lines.iter().cloned());
        offset += hunk.new_lines.len() as isize - hunk.old_lines.len() as isize;
    }

    let mut result = lines.join("\n");
    if content.ends_with('\n') || content.is_empty() {
        result.push('\n');
    }
    Ok(result)
}
