use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use maestro_provider::Provider;

use crate::agent::{run_loop, LoopBudget};
use crate::census::WorkspaceCensus;
use crate::roles::{spec_for, AgentRole};
use crate::tools::{ToolContext, ToolRegistry};

/// Validation layers, in execution order: build, review, tests, log analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Build,
    Review,
    Tests,
    Logs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResult {
    Approved,
    ChangesRequested,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogResult {
    Clean,
    Warn,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overall {
    Success,
    Partial,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub build: BuildResult,
    pub review: ReviewResult,
    pub tests: TestResult,
    pub logs: LogResult,
    pub overall: Overall,
    pub details: Vec<String>,
}

impl Verdict {
    fn aggregate(
        build: BuildResult,
        review: ReviewResult,
        tests: TestResult,
        logs: LogResult,
        details: Vec<String>,
    ) -> Self {
        let overall = if build == BuildResult::Fail
            || tests == TestResult::Fail
            || review == ReviewResult::Rejected
        {
            Overall::Fail
        } else if matches!(build, BuildResult::Pass | BuildResult::Skipped)
            && matches!(review, ReviewResult::Approved | ReviewResult::Skipped)
            && matches!(tests, TestResult::Pass | TestResult::Skipped)
            && matches!(logs, LogResult::Clean | LogResult::Skipped)
        {
            Overall::Success
        } else {
            Overall::Partial
        };

        Self {
            build,
            review,
            tests,
            logs,
            overall,
            details,
        }
    }
}

/// The review layer needs a live model; everything it borrows comes bundled.
pub struct Reviewer<'a> {
    pub provider: &'a dyn Provider,
    pub model: String,
    pub registry: &'a ToolRegistry,
    pub ctx: &'a ToolContext,
}

pub struct Validator {
    workspace_root: PathBuf,
    build_command: Option<String>,
    test_command: Option<String>,
}

impl Validator {
    pub fn new(workspace_root: &Path, census: &WorkspaceCensus) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            build_command: census.build_command.clone(),
            test_command: census.test_command.clone(),
        }
    }

    /// Run the requested layers sequentially and aggregate one verdict.
    /// A build failure stops everything after it.
    pub async fn run(
        &self,
        layers: &[Layer],
        reviewer: Option<Reviewer<'_>>,
        agent_log: &str,
    ) -> Verdict {
        let mut details = Vec::new();

        let build = if layers.contains(&Layer::Build) {
            match &self.build_command {
                Some(cmd) => {
                    let (ok, output) = run_command(cmd, &self.workspace_root).await;
                    details.push(format!("build `{cmd}`: {}", if ok { "pass" } else { "fail" }));
                    if !ok {
                        details.push(tail(&output, 500));
                    }
                    if ok {
                        BuildResult::Pass
                    } else {
                        BuildResult::Fail
                    }
                }
                None => BuildResult::Skipped,
            }
        } else {
            BuildResult::Skipped
        };

        if build == BuildResult::Fail {
            return Verdict::aggregate(
                build,
                ReviewResult::Skipped,
                TestResult::Skipped,
                LogResult::Skipped,
                details,
            );
        }

        let review = if layers.contains(&Layer::Review) {
            match reviewer {
                Some(r) => {
                    let result = self.run_review(r).await;
                    details.push(format!("review: {result:?}"));
                    result
                }
                None => ReviewResult::Skipped,
            }
        } else {
            ReviewResult::Skipped
        };

        let tests = if layers.contains(&Layer::Tests) {
            match &self.test_command {
                Some(cmd) => {
                    let (ok, output) = run_command(cmd, &self.workspace_root).await;
                    details.push(format!("tests `{cmd}`: {}", if ok { "pass" } else { "fail" }));
                    if !ok {
                        details.push(tail(&output, 500));
                    }
                    if ok {
                        TestResult::Pass
                    } else {
                        TestResult::Fail
                    }
                }
                None => TestResult::Skipped,
            }
        } else {
            TestResult::Skipped
        };

        let logs = if layers.contains(&Layer::Logs) {
            let matches = scan_log(agent_log);
            if matches.is_empty() {
                LogResult::Clean
            } else {
                details.push(format!("log analysis matched: {}", matches.join(", ")));
                LogResult::Warn
            }
        } else {
            LogResult::Skipped
        };

        Verdict::aggregate(build, review, tests, logs, details)
    }

    async fn run_review(&self, reviewer: Reviewer<'_>) -> ReviewResult {
        let diff = crate::tools::git::working_tree_diff(&self.workspace_root).await;
        if diff.trim().is_empty() {
            return ReviewResult::Skipped;
        }

        let spec = spec_for(AgentRole::Reviewer);
        let prompt = spec.build_prompt(&format!("Diff under review:\n\n```diff\n{diff}\n```"));

        let outcome = run_loop(
            reviewer.provider,
            &reviewer.model,
            "You are a meticulous code reviewer.",
            &prompt,
            reviewer.registry,
            spec.allowed_tools,
            reviewer.ctx,
            LoopBudget {
                max_iterations: 8,
                ..Default::default()
            },
        )
        .await;

        if !outcome.completed() {
            tracing::warn!(phase = ?outcome.phase, "review agent did not finish");
            return ReviewResult::ChangesRequested;
        }
        parse_review_verdict(&outcome.final_text)
    }
}

/// Substring token parse; ambiguity (none, or more than one distinct token)
/// defaults to changes requested.
pub fn parse_review_verdict(text: &str) -> ReviewResult {
    let approved = text.contains("APPROVED") && !text.contains("NOT APPROVED");
    let lgtm = text.contains("LGTM");
    let changes = text.contains("CHANGES_REQUESTED");
    let rejected = text.contains("REJECTED");

    match (approved || lgtm, changes, rejected) {
        (true, false, false) => ReviewResult::Approved,
        (false, false, true) => ReviewResult::Rejected,
        (false, true, false) => ReviewResult::ChangesRequested,
        _ => ReviewResult::ChangesRequested,
    }
}

/// Error cues the log layer greps for.
fn scan_log(log: &str) -> Vec<&'static str> {
    const PATTERNS: &[(&str, &str)] = &[
        ("panic:", r"panic:"),
        ("fatal:", r"fatal:"),
        ("timeout", r"(?i)timeout"),
        ("rate limit", r"(?i)rate limit"),
        ("429", r"\b429\b"),
    ];

    PATTERNS
        .iter()
        .filter(|(_, pattern)| {
            regex::Regex::new(pattern)
                .map(|re| re.is_match(log))
                .unwrap_or(false)
        })
        .map(|(name, _)| *name)
        .collect()
}

async fn run_command(command: &str, cwd: &Path) -> (bool, String) {
    let result = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await;

    match result {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            (output.status.success(), text)
        }
        Err(e) => (false, format!("failed to execute `{command}`: {e}")),
    }
}

fn tail(text: &str, max: usize) -> String {
    if text.len() > max {
        format!("...{}", &text[text.len() - max..])
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedProvider};
    use crate::tools::default_registry;

    fn validator(dir: &Path, build: Option<&str>, test: Option<&str>) -> Validator {
        Validator {
            workspace_root: dir.to_path_buf(),
            build_command: build.map(String::from),
            test_command: test.map(String::from),
        }
    }

    const ALL_LAYERS: &[Layer] = &[Layer::Build, Layer::Review, Layer::Tests, Layer::Logs];

    #[tokio::test]
    async fn all_pass_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path(), Some("true"), Some("true"));
        let verdict = v.run(ALL_LAYERS, None, "").await;
        assert_eq!(verdict.build, BuildResult::Pass);
        assert_eq!(verdict.review, ReviewResult::Skipped);
        assert_eq!(verdict.tests, TestResult::Pass);
        assert_eq!(verdict.logs, LogResult::Clean);
        assert_eq!(verdict.overall, Overall::Success);
    }

    #[tokio::test]
    async fn build_failure_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path(), Some("false"), Some("true"));
        let verdict = v.run(ALL_LAYERS, None, "").await;
        assert_eq!(verdict.build, BuildResult::Fail);
        assert_eq!(verdict.tests, TestResult::Skipped);
        assert_eq!(verdict.logs, LogResult::Skipped);
        assert_eq!(verdict.overall, Overall::Fail);
    }

    #[tokio::test]
    async fn log_warnings_degrade_to_partial_not_fail() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path(), Some("true"), None);
        let verdict = v
            .run(ALL_LAYERS, None, "provider said: 429 Too Many Requests")
            .await;
        assert_eq!(verdict.logs, LogResult::Warn);
        assert_eq!(verdict.overall, Overall::Partial);
    }

    #[tokio::test]
    async fn skipped_tests_count_as_pass_for_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path(), Some("true"), None);
        let verdict = v.run(&[Layer::Build, Layer::Tests], None, "").await;
        assert_eq!(verdict.tests, TestResult::Skipped);
        assert_eq!(verdict.overall, Overall::Success);
    }

    #[tokio::test]
    async fn validator_is_deterministic_on_an_unchanged_tree() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(dir.path(), Some("true"), Some("true"));
        let first = v.run(ALL_LAYERS, None, "clean run").await;
        let second = v.run(ALL_LAYERS, None, "clean run").await;
        assert_eq!(first.overall, second.overall);
        assert_eq!(first.build, second.build);
        assert_eq!(first.tests, second.tests);
        assert_eq!(first.logs, second.logs);
    }

    #[tokio::test]
    async fn review_verdict_feeds_overall() {
        let dir = tempfile::tempdir().unwrap();
        crate::tools::git::run_git(&["init", "-q"], dir.path()).await.unwrap();
        crate::tools::git::run_git(&["config", "user.email", "t@t"], dir.path())
            .await
            .unwrap();
        crate::tools::git::run_git(&["config", "user.name", "t"], dir.path())
            .await
            .unwrap();
        std::fs::write(dir.path().join("f.txt"), "old\n").unwrap();
        crate::tools::git::run_git(&["add", "."], dir.path()).await.unwrap();
        crate::tools::git::run_git(&["commit", "-q", "-m", "init"], dir.path())
            .await
            .unwrap();
        std::fs::write(dir.path().join("f.txt"), "new\n").unwrap();

        let provider = ScriptedProvider::new(vec![Reply::Text(
            "The change looks wrong.\nCHANGES_REQUESTED".into(),
        )]);
        let registry = default_registry();
        let ctx = ToolContext::new(dir.path());

        let v = validator(dir.path(), Some("true"), Some("true"));
        let verdict = v
            .run(
                ALL_LAYERS,
                Some(Reviewer {
                    provider: &provider,
                    model: "m".into(),
                    registry: &registry,
                    ctx: &ctx,
                }),
                "",
            )
            .await;

        assert_eq!(verdict.review, ReviewResult::ChangesRequested);
        assert_eq!(verdict.overall, Overall::Partial);
    }

    #[test]
    fn verdict_token_parsing() {
        assert_eq!(parse_review_verdict("APPROVED"), ReviewResult::Approved);
        assert_eq!(parse_review_verdict("LGTM!"), ReviewResult::Approved);
        assert_eq!(parse_review_verdict("REJECTED"), ReviewResult::Rejected);
        assert_eq!(
            parse_review_verdict("CHANGES_REQUESTED"),
            ReviewResult::ChangesRequested
        );
        // Ambiguous responses default to changes requested.
        assert_eq!(
            parse_review_verdict("APPROVED or maybe REJECTED"),
            ReviewResult::ChangesRequested
        );
        assert_eq!(parse_review_verdict("no token at all"), ReviewResult::ChangesRequested);
    }

    #[test]
    fn success_implies_build_pass_or_skip() {
        let verdict = Verdict::aggregate(
            BuildResult::Pass,
            ReviewResult::Approved,
            TestResult::Pass,
            LogResult::Clean,
            vec![],
        );
        assert_eq!(verdict.overall, Overall::Success);

        let verdict = Verdict::aggregate(
            BuildResult::Fail,
            ReviewResult::Approved,
            TestResult::Pass,
            LogResult::Clean,
            vec![],
        );
        assert_eq!(verdict.overall, Overall::Fail);
    }
}
