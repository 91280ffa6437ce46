pub mod git;
pub mod list;
pub mod patch;
pub mod read;
pub mod shell;
pub mod write;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use maestro_provider::ToolDefinition;

/// A named side-effecting operation the agent can invoke. `execute` returns
/// `ok: false` for failures the model should see and react to; `Err` is
/// reserved for malformed invocations.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    fn read_only(&self) -> bool {
        true
    }
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutcome>;
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub ok: bool,
    pub content: String,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
        }
    }

    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: content.into(),
        }
    }
}

#[derive(Clone)]
pub struct ToolContext {
    /// Every path-bearing tool is confined to this directory.
    pub workspace_root: PathBuf,
    pub deadline: Option<tokio::time::Instant>,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Resolve a model-supplied path inside the workspace. Absolute paths are
    /// accepted only when they already point into the workspace; `..` may not
    /// escape it.
    pub fn confine(&self, raw: &str) -> Result<PathBuf> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace_root.join(candidate)
        };

        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        anyhow::bail!("path escapes the working directory: {raw}");
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }

        if !normalized.starts_with(&self.workspace_root) {
            anyhow::bail!("path escapes the working directory: {raw}");
        }
        Ok(normalized)
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions restricted to a role's whitelist.
    pub fn definitions_for(&self, allowed: &[&str]) -> Vec<ToolDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| allowed.contains(&d.name.as_str()))
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<ToolOutcome> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown tool: {name}"))?;
        tool.execute(args, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry's declared minimum set.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(read::ReadFileTool));
    registry.register(Box::new(write::WriteFileTool));
    registry.register(Box::new(list::ListFilesTool));
    registry.register(Box::new(shell::RunShellTool));
    registry.register(Box::new(patch::ApplyPatchTool));
    registry.register(Box::new(git::GitLogTool));
    registry.register(Box::new(git::GitDiffTool));
    registry
}

pub(crate) fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: {key}"))
}
