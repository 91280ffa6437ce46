use serde::{Deserialize, Serialize};

/// The fixed set of functions an LLM can be asked to perform. Roles are data:
/// adding one means adding a table entry, not touching the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Router,
    Query,
    Editor,
    Reviewer,
    Researcher,
    Planner,
    Classifier,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Router => "router",
            AgentRole::Query => "query",
            AgentRole::Editor => "editor",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Researcher => "researcher",
            AgentRole::Planner => "planner",
            AgentRole::Classifier => "classifier",
        }
    }

    pub fn all() -> &'static [AgentRole] {
        &[
            AgentRole::Router,
            AgentRole::Query,
            AgentRole::Editor,
            AgentRole::Reviewer,
            AgentRole::Researcher,
            AgentRole::Planner,
            AgentRole::Classifier,
        ]
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of how a role runs: its prompt template and the tools
/// it may call. Resolution is table lookup.
#[derive(Debug, Clone, Copy)]
pub struct RoleSpec {
    pub role: AgentRole,
    pub read_only: bool,
    pub allowed_tools: &'static [&'static str],
    prompt_template: &'static str,
}

impl RoleSpec {
    pub fn build_prompt(&self, task: &str) -> String {
        self.prompt_template.replace("{task}", task)
    }
}

const READ_TOOLS: &[&str] = &["read_file", "list_files", "git_log", "git_diff"];
const ALL_TOOLS: &[&str] = &[
    "read_file",
    "write_file",
    "list_files",
    "run_shell",
    "apply_patch",
    "git_log",
    "git_diff",
];

const SPECS: &[RoleSpec] = &[
    RoleSpec {
        role: AgentRole::Router,
        read_only: true,
        allowed_tools: &[],
        prompt_template: "Classify the engineering task below and answer with a single word: \
                          trivial, simple, complex, or multistep.\n\nTask: {task}",
    },
    RoleSpec {
        role: AgentRole::Query,
        read_only: true,
        allowed_tools: READ_TOOLS,
        prompt_template: "Answer the question about this codebase. Read only what you need; \
                          do not modify anything.\n\nQuestion: {task}",
    },
    RoleSpec {
        role: AgentRole::Editor,
        read_only: false,
        allowed_tools: ALL_TOOLS,
        prompt_template: "Complete the engineering task below against the working directory. \
                          Make the smallest change that fully solves it, then stop. Use the \
                          available tools to read, edit, and verify.\n\nTask: {task}",
    },
    RoleSpec {
        role: AgentRole::Reviewer,
        read_only: true,
        allowed_tools: READ_TOOLS,
        prompt_template: "Review the change described below for correctness, regressions, and \
                          style. End your reply with exactly one verdict token on its own line: \
                          APPROVED, CHANGES_REQUESTED, or REJECTED.\n\n{task}",
    },
    RoleSpec {
        role: AgentRole::Researcher,
        read_only: true,
        allowed_tools: READ_TOOLS,
        prompt_template: "Investigate the topic below in this repository and report what you \
                          find, citing file paths.\n\nTopic: {task}",
    },
    RoleSpec {
        role: AgentRole::Planner,
        read_only: true,
        allowed_tools: READ_TOOLS,
        prompt_template: "Produce a numbered, step-by-step implementation plan for the task \
                          below. Each step must be independently executable and name the files \
                          it touches. Output only the numbered list.\n\nTask: {task}",
    },
    RoleSpec {
        role: AgentRole::Classifier,
        read_only: true,
        allowed_tools: &[],
        prompt_template: "Classify the following input.\n\n{task}",
    },
];

pub fn spec_for(role: AgentRole) -> &'static RoleSpec {
    SPECS
        .iter()
        .find(|s| s.role == role)
        .expect("every role has a spec entry")
}
