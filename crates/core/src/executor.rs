use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use maestro_provider::Provider;

use crate::agent::{run_loop, LoopBudget, LoopOutcome};
use crate::census::WorkspaceCensus;
use crate::errors::ErrorKind;
use crate::feedback::OutcomeLogger;
use crate::recommend::{Recommendation, Recommender};
use crate::roles::{spec_for, AgentRole};
use crate::router::PipelinePlan;
use crate::task::Task;
use crate::tools::{ToolContext, ToolRegistry};
use crate::validate::{Layer, Overall, Reviewer, Validator, Verdict};

/// Resolves a backend id to a live provider. Injected so tests can script
/// providers; production wires this to the provider factory.
pub type ProviderFactory = Box<dyn Fn(&str) -> Result<Arc<dyn Provider>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Partial,
    Fail,
    Cancelled,
    NoSuitableModel,
}

#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: RunOutcome,
    pub verdict: Option<Verdict>,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub final_text: String,
}

impl ExecutionReport {
    fn terminal(outcome: RunOutcome, attempts: u32, error_kind: Option<ErrorKind>) -> Self {
        Self {
            outcome,
            verdict: None,
            attempts,
            error_kind,
            final_text: String::new(),
        }
    }
}

pub struct Executor {
    recommender: Recommender,
    logger: OutcomeLogger,
    registry: ToolRegistry,
    workspace_root: PathBuf,
    census: WorkspaceCensus,
    factory: ProviderFactory,
    cancel: CancellationToken,
    agent_budget: LoopBudget,
}

impl Executor {
    pub fn new(
        recommender: Recommender,
        logger: OutcomeLogger,
        registry: ToolRegistry,
        workspace_root: PathBuf,
        census: WorkspaceCensus,
        factory: ProviderFactory,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            recommender,
            logger,
            registry,
            workspace_root,
            census,
            factory,
            cancel,
            agent_budget: LoopBudget::default(),
        }
    }

    pub fn with_agent_budget(mut self, budget: LoopBudget) -> Self {
        self.agent_budget = budget;
        self
    }

    /// Execute the plan with automatic recovery: a recoverable agent failure
    /// restarts the attempt under an alternate (backend, model); a partial
    /// verdict retries until attempts run out. Artifacts on disk are never
    /// reverted.
    pub async fn execute(&mut self, task: &Task, plan: &PipelinePlan) -> ExecutionReport {
        let validator = Validator::new(&self.workspace_root, &self.census);
        let mut last_failed: Option<(String, String)> = None;
        let mut min_context: Option<u32> = None;

        for attempt in 1..=plan.max_attempts {
            if self.cancel.is_cancelled() {
                return ExecutionReport::terminal(
                    RunOutcome::Cancelled,
                    attempt - 1,
                    Some(ErrorKind::Cancelled),
                );
            }
            tracing::info!(attempt, max = plan.max_attempts, kind = %plan.kind, "starting attempt");

            // Selection happens before any agent runs. Without per-role
            // selection, one pair serves every agent in the attempt.
            let shared_pick = if plan.per_role_selection {
                None
            } else {
                let role = plan.agents.first().copied().unwrap_or(AgentRole::Editor);
                Some(self.pick(role, last_failed.as_ref(), min_context))
            };
            if let Some(pick) = &shared_pick {
                if pick.backend.is_empty() || pick.model.is_empty() {
                    return ExecutionReport::terminal(RunOutcome::NoSuitableModel, attempt - 1, None);
                }
            }

            let mut attempt_log = String::new();
            let mut final_text = String::new();
            let mut plan_text: Option<String> = None;
            let mut restart_attempt = false;

            for role in &plan.agents {
                let pick = match &shared_pick {
                    Some(p) => p.clone(),
                    None => {
                        let p = self.pick(*role, last_failed.as_ref(), min_context);
                        if p.backend.is_empty() || p.model.is_empty() {
                            return ExecutionReport::terminal(
                                RunOutcome::NoSuitableModel,
                                attempt - 1,
                                None,
                            );
                        }
                        p
                    }
                };

                let steps: Vec<String> = match (*role, &plan_text) {
                    (AgentRole::Editor, Some(text)) => {
                        let steps = split_steps(text);
                        if steps.is_empty() {
                            vec![task.text.clone()]
                        } else {
                            steps
                                .into_iter()
                                .map(|s| format!("{s}\n\nOverall task: {}", task.text))
                                .collect()
                        }
                    }
                    _ => vec![task.text.clone()],
                };

                for step in steps {
                    match self.run_agent(task, *role, &pick, &step).await {
                        AgentRun::Completed(outcome) => {
                            for inv in &outcome.invocations {
                                attempt_log.push_str(&inv.output);
                                attempt_log.push('\n');
                            }
                            if *role == AgentRole::Planner {
                                plan_text = Some(outcome.final_text.clone());
                            }
                            final_text = outcome.final_text;
                        }
                        AgentRun::Recoverable(kind) => {
                            tracing::warn!(%kind, backend = %pick.backend, model = %pick.model,
                                "recoverable failure, switching model");
                            if kind == ErrorKind::ContextOverflow {
                                min_context = Some(estimate_transcript_tokens(task));
                            }
                            last_failed = Some((pick.backend.clone(), pick.model.clone()));
                            restart_attempt = true;
                        }
                        AgentRun::Fatal(kind) => {
                            if kind == ErrorKind::AuthFailed {
                                self.recommender.penalize_backend(&pick.backend);
                            }
                            return ExecutionReport::terminal(
                                if kind == ErrorKind::Cancelled {
                                    RunOutcome::Cancelled
                                } else {
                                    RunOutcome::Fail
                                },
                                attempt,
                                Some(kind),
                            );
                        }
                    }
                    if restart_attempt {
                        break;
                    }
                }
                if restart_attempt {
                    break;
                }
            }

            if restart_attempt {
                continue;
            }

            let reviewer_bundle = if plan.validation_layers.contains(&Layer::Review) {
                self.reviewer(last_failed.as_ref())
            } else {
                None
            };
            let reviewer_ctx = ToolContext {
                workspace_root: self.workspace_root.clone(),
                deadline: None,
                cancel: self.cancel.clone(),
            };
            let verdict = validator
                .run(
                    &plan.validation_layers,
                    reviewer_bundle.as_ref().map(|(provider, model)| Reviewer {
                        provider: provider.as_ref(),
                        model: model.clone(),
                        registry: &self.registry,
                        ctx: &reviewer_ctx,
                    }),
                    &attempt_log,
                )
                .await;

            tracing::info!(overall = ?verdict.overall, attempt, "validation verdict");
            match verdict.overall {
                Overall::Success => {
                    return ExecutionReport {
                        outcome: RunOutcome::Success,
                        verdict: Some(verdict),
                        attempts: attempt,
                        error_kind: None,
                        final_text,
                    };
                }
                Overall::Partial if attempt < plan.max_attempts => {
                    // Retries always move to a different pair, even when the
                    // failure was a verdict rather than an agent error.
                    if let Some(pick) = shared_pick {
                        last_failed = Some((pick.backend, pick.model));
                    }
                    continue;
                }
                Overall::Partial => {
                    return ExecutionReport {
                        outcome: RunOutcome::Partial,
                        verdict: Some(verdict),
                        attempts: attempt,
                        error_kind: None,
                        final_text,
                    };
                }
                Overall::Fail => {
                    return ExecutionReport {
                        outcome: RunOutcome::Fail,
                        verdict: Some(verdict),
                        attempts: attempt,
                        error_kind: Some(ErrorKind::ValidationFailed),
                        final_text,
                    };
                }
            }
        }

        // Every attempt restarted on recoverable errors without reaching
        // validation.
        ExecutionReport::terminal(RunOutcome::Fail, plan.max_attempts, None)
    }

    fn pick(
        &mut self,
        role: AgentRole,
        failed: Option<&(String, String)>,
        min_context: Option<u32>,
    ) -> Recommendation {
        let ranked = self.recommender.select(role, failed, min_context);
        let top = ranked[0].clone();
        tracing::debug!(
            role = %role,
            backend = %top.backend,
            model = %top.model,
            score = top.score,
            reason = %top.reason,
            "selected model"
        );
        top
    }

    async fn run_agent(
        &mut self,
        task: &Task,
        role: AgentRole,
        pick: &Recommendation,
        input: &str,
    ) -> AgentRun {
        let provider = match (self.factory)(&pick.backend) {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, backend = %pick.backend, "provider construction failed");
                return AgentRun::Fatal(ErrorKind::ConfigError);
            }
        };

        let spec = spec_for(role);
        let prompt = spec.build_prompt(input);
        let ctx = ToolContext {
            workspace_root: self.workspace_root.clone(),
            deadline: self.agent_budget.deadline,
            cancel: self.cancel.clone(),
        };

        let start = std::time::Instant::now();
        let outcome = run_loop(
            provider.as_ref(),
            &pick.model,
            "You are a focused software engineering agent.",
            &prompt,
            &self.registry,
            spec.allowed_tools,
            &ctx,
            self.agent_budget,
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        if let Err(err) = self
            .logger
            .record(task, &pick.backend, &pick.model, role, &outcome, latency_ms)
        {
            tracing::warn!(%err, "failed to write execution record");
        }
        // History advanced; cached rankings must not outlive it.
        self.recommender.invalidate();

        match outcome.error_kind {
            None => AgentRun::Completed(outcome),
            Some(ErrorKind::Cancelled) => AgentRun::Fatal(ErrorKind::Cancelled),
            Some(kind) if kind.is_recoverable() => AgentRun::Recoverable(kind),
            Some(kind) => AgentRun::Fatal(kind),
        }
    }

    /// Reviewer backing for L2: the recommender's current best pick for the
    /// reviewer role, or none when nothing resolves.
    fn reviewer(
        &mut self,
        failed: Option<&(String, String)>,
    ) -> Option<(Arc<dyn Provider>, String)> {
        let pick = self.pick(AgentRole::Reviewer, failed, None);
        if pick.backend.is_empty() || pick.model.is_empty() {
            return None;
        }
        match (self.factory)(&pick.backend) {
            Ok(provider) => Some((provider, pick.model)),
            Err(err) => {
                tracing::warn!(%err, "no provider for reviewer, skipping review layer");
                None
            }
        }
    }
}

enum AgentRun {
    Completed(LoopOutcome),
    Recoverable(ErrorKind),
    Fatal(ErrorKind),
}

/// Numbered lines of a planner reply become symphony steps.
fn split_steps(plan_text: &str) -> Vec<String> {
    plan_text
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let rest = trimmed
                .split_once('.')
                .filter(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
                .map(|(_, rest)| rest.trim());
            rest.filter(|r| !r.is_empty()).map(String::from)
        })
        .collect()
}

/// Context floor for retrying after an overflow: generous estimate of the
/// transcript the failed model refused.
fn estimate_transcript_tokens(task: &Task) -> u32 {
    (task.features.approx_tokens as u32).saturating_mul(4).max(16_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStore;
    use crate::recommend::Recommender;
    use crate::router::{PipelineKind, TaskClass};
    use crate::testing::{Reply, ScriptedProvider};
    use crate::tools::default_registry;
    use crate::validate::Layer;
    use maestro_config::{Mode, Setup};
    use maestro_provider::{Catalog, CatalogEntry};
    use serde_json::json;
    use std::collections::HashMap;

    fn entry(backend: &str, model: &str, tps: f64) -> CatalogEntry {
        CatalogEntry {
            backend_id: backend.into(),
            model_name: model.into(),
            context_window: 128_000,
            cost_per_1m_in: 0.0,
            cost_per_1m_out: 0.0,
            speed_tps: tps,
            supports_tools: true,
            supports_json: false,
            tags: vec![],
            recommended_for: vec!["editor".into()],
        }
    }

    fn setup(mode: Mode, backends: &[&str]) -> Setup {
        let mut setup = Setup::default();
        setup.defaults.mode = mode;
        for id in backends {
            setup.backends.insert(
                id.to_string(),
                maestro_config::BackendEntry {
                    backend_type: "openai".into(),
                    base_url: Some("http://test".into()),
                    default_model: "default-model".into(),
                    ..Default::default()
                },
            );
        }
        if let Some(first) = backends.first() {
            setup.defaults.backend = first.to_string();
            setup.defaults.model = "default-model".into();
        }
        setup
    }

    fn plan(layers: Vec<Layer>, max_attempts: u32) -> PipelinePlan {
        PipelinePlan {
            kind: PipelineKind::Autonomous,
            class: TaskClass::Complex,
            agents: vec![AgentRole::Editor],
            max_attempts,
            validation_layers: layers,
            per_role_selection: false,
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        workspace: PathBuf,
        store: HistoryStore,
        providers: HashMap<String, Arc<ScriptedProvider>>,
    }

    impl Harness {
        fn new(providers: Vec<(&str, ScriptedProvider)>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let workspace = dir.path().join("ws");
            std::fs::create_dir_all(&workspace).unwrap();
            let store = HistoryStore::new(dir.path().join("history.jsonl"));
            Self {
                _dir: dir,
                workspace,
                store,
                providers: providers
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), Arc::new(v)))
                    .collect(),
            }
        }

        fn executor(&self, setup: Setup, catalog: Catalog) -> Executor {
            let recommender =
                Recommender::new(setup, catalog, self.store.clone());
            let logger = OutcomeLogger::new(self.store.clone());
            let providers = self.providers.clone();
            let factory: ProviderFactory = Box::new(move |backend| {
                providers
                    .get(backend)
                    .cloned()
                    .map(|p| p as Arc<dyn Provider>)
                    .ok_or_else(|| anyhow::anyhow!("no provider for {backend}"))
            });
            Executor::new(
                recommender,
                logger,
                default_registry(),
                self.workspace.clone(),
                WorkspaceCensus::default(),
                factory,
                CancellationToken::new(),
            )
        }
    }

    #[tokio::test]
    async fn tool_unsupported_triggers_retry_under_alternate_backend() {
        // Backend x ranks first (faster) but cannot call tools; backend y
        // succeeds on the retry.
        let harness = Harness::new(vec![
            ("x", ScriptedProvider::new(vec![Reply::ToolsUnsupported])),
            (
                "y",
                ScriptedProvider::new(vec![
                    Reply::ToolCalls(vec![(
                        "write_file".into(),
                        json!({"path": "hello.txt", "content": "Hello"}),
                    )]),
                    Reply::Text("created hello.txt".into()),
                ]),
            ),
        ]);
        let catalog = Catalog::from_entries(vec![
            entry("x", "fast-no-tools", 900.0),
            entry("y", "kimi-free", 100.0),
        ]);
        let mut executor = harness.executor(setup(Mode::Hybrid, &["x", "y"]), catalog);

        let task = Task::new("create hello.txt with content 'Hello'");
        let report = executor.execute(&task, &plan(vec![], 3)).await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(report.attempts, 2);
        assert_eq!(
            std::fs::read_to_string(harness.workspace.join("hello.txt")).unwrap(),
            "Hello"
        );

        let records = harness.store.recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert_eq!(records[0].error_kind, Some(ErrorKind::ToolNotAvailable));
        assert_eq!(records[0].backend, "x");
        assert!(records[1].success);
        assert_eq!(records[1].backend, "y");
    }

    #[tokio::test]
    async fn retry_never_reuses_the_failed_pair() {
        let harness = Harness::new(vec![
            ("x", ScriptedProvider::new(vec![Reply::RateLimited])),
            ("y", ScriptedProvider::new(vec![Reply::Text("done".into())])),
        ]);
        let catalog = Catalog::from_entries(vec![
            entry("x", "m1", 900.0),
            entry("y", "m2", 100.0),
        ]);
        let mut executor = harness.executor(setup(Mode::Hybrid, &["x", "y"]), catalog);

        let task = Task::new("small change");
        let report = executor.execute(&task, &plan(vec![], 3)).await;
        assert_eq!(report.outcome, RunOutcome::Success);

        let records = harness.store.recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_ne!(
            (records[0].backend.clone(), records[0].model.clone()),
            (records[1].backend.clone(), records[1].model.clone())
        );
    }

    #[tokio::test]
    async fn non_recoverable_failure_surfaces_with_kind() {
        let harness = Harness::new(vec![(
            "x",
            ScriptedProvider::new(vec![Reply::AuthFailed]),
        )]);
        let catalog = Catalog::from_entries(vec![entry("x", "m1", 100.0)]);
        let mut executor = harness.executor(setup(Mode::Hybrid, &["x"]), catalog);

        let task = Task::new("anything");
        let report = executor.execute(&task, &plan(vec![], 3)).await;

        assert_eq!(report.outcome, RunOutcome::Fail);
        assert_eq!(report.error_kind, Some(ErrorKind::AuthFailed));
        // The failed attempt is still recorded.
        assert_eq!(harness.store.recent(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn partial_verdict_retries_then_returns_partial() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();

        // A git repo with an uncommitted change gives the reviewer a diff.
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@t"],
            vec!["config", "user.name", "t"],
        ] {
            crate::tools::git::run_git(&args, &workspace).await.unwrap();
        }
        std::fs::write(workspace.join("f.txt"), "old\n").unwrap();
        crate::tools::git::run_git(&["add", "."], &workspace).await.unwrap();
        crate::tools::git::run_git(&["commit", "-q", "-m", "init"], &workspace)
            .await
            .unwrap();
        std::fs::write(workspace.join("f.txt"), "new\n").unwrap();

        // Editor and reviewer share the single configured pair, so replies
        // interleave: editor, reviewer, editor, reviewer.
        let provider = ScriptedProvider::new(vec![
            Reply::Text("edited".into()),
            Reply::Text("needs work\nCHANGES_REQUESTED".into()),
            Reply::Text("edited again".into()),
            Reply::Text("still needs work\nCHANGES_REQUESTED".into()),
        ]);

        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        let providers: HashMap<String, Arc<ScriptedProvider>> =
            [("x".to_string(), Arc::new(provider))].into();
        let providers_for_factory = providers.clone();
        let factory: ProviderFactory = Box::new(move |backend| {
            providers_for_factory
                .get(backend)
                .cloned()
                .map(|p| p as Arc<dyn Provider>)
                .ok_or_else(|| anyhow::anyhow!("no provider for {backend}"))
        });

        let catalog = Catalog::from_entries(vec![entry("x", "m1", 100.0)]);
        let mut executor = Executor::new(
            Recommender::new(setup(Mode::Hybrid, &["x"]), catalog, store.clone()),
            OutcomeLogger::new(store),
            default_registry(),
            workspace.clone(),
            WorkspaceCensus::default(),
            factory,
            CancellationToken::new(),
        );

        let task = Task::new("touch f.txt");
        let report = executor.execute(&task, &plan(vec![Layer::Review], 2)).await;

        assert_eq!(report.outcome, RunOutcome::Partial);
        assert_eq!(report.attempts, 2);
        let verdict = report.verdict.unwrap();
        assert_eq!(verdict.overall, Overall::Partial);
    }

    #[tokio::test]
    async fn local_mode_without_ollama_runs_fallback_once_and_records() {
        let harness = Harness::new(vec![(
            "x",
            ScriptedProvider::new(vec![Reply::Text("done".into())]),
        )]);
        // Catalog only covers backend x, which local mode filters out.
        let catalog = Catalog::from_entries(vec![entry("x", "default-model", 100.0)]);
        let mut executor = harness.executor(setup(Mode::Local, &["x"]), catalog);

        let task = Task::new("anything");
        let report = executor.execute(&task, &plan(vec![], 1)).await;

        assert_eq!(report.outcome, RunOutcome::Success);
        let records = harness.store.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backend, "x");
        assert_eq!(records[0].model, "default-model");
    }

    #[tokio::test]
    async fn no_configuration_at_all_is_no_suitable_model() {
        let harness = Harness::new(vec![]);
        let mut executor = harness.executor(Setup::default(), Catalog::default());

        let task = Task::new("anything");
        let report = executor.execute(&task, &plan(vec![], 1)).await;
        assert_eq!(report.outcome, RunOutcome::NoSuitableModel);
    }

    #[tokio::test]
    async fn cancellation_before_start_returns_cancelled() {
        let harness = Harness::new(vec![(
            "x",
            ScriptedProvider::new(vec![Reply::Text("never".into())]),
        )]);
        let catalog = Catalog::from_entries(vec![entry("x", "m1", 100.0)]);
        let mut executor = harness.executor(setup(Mode::Hybrid, &["x"]), catalog);
        executor.cancel.cancel();

        let task = Task::new("anything");
        let report = executor.execute(&task, &plan(vec![], 3)).await;
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(harness.providers["x"].call_count(), 0);
    }

    #[tokio::test]
    async fn symphony_runs_planner_then_one_editor_pass_per_step() {
        let provider = ScriptedProvider::new(vec![
            // Planner output with two steps.
            Reply::Text("1. write a.txt\n2. write b.txt".into()),
            // Editor pass for step 1.
            Reply::ToolCalls(vec![(
                "write_file".into(),
                json!({"path": "a.txt", "content": "A"}),
            )]),
            Reply::Text("step one done".into()),
            // Editor pass for step 2.
            Reply::ToolCalls(vec![(
                "write_file".into(),
                json!({"path": "b.txt", "content": "B"}),
            )]),
            Reply::Text("step two done".into()),
        ]);
        let harness = Harness::new(vec![("x", provider)]);
        let catalog = Catalog::from_entries(vec![entry("x", "m1", 100.0)]);
        let mut executor = harness.executor(setup(Mode::Hybrid, &["x"]), catalog);

        let symphony = PipelinePlan {
            kind: PipelineKind::Symphony,
            class: TaskClass::Multistep,
            agents: vec![AgentRole::Planner, AgentRole::Editor],
            max_attempts: 3,
            validation_layers: vec![],
            per_role_selection: true,
        };
        let task = Task::new("write a.txt and then write b.txt");
        let report = executor.execute(&task, &symphony).await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert!(harness.workspace.join("a.txt").exists());
        assert!(harness.workspace.join("b.txt").exists());
        // planner + two editor steps = three records.
        assert_eq!(harness.store.recent(10).unwrap().len(), 3);
    }

    #[test]
    fn split_steps_parses_numbered_lines() {
        let steps = split_steps("1. do x\n2. do y\nnot a step\n10. do z");
        assert_eq!(steps, vec!["do x", "do y", "do z"]);
        assert!(split_steps("no numbering here").is_empty());
    }
}
