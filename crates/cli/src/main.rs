use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use maestro_config::Setup;
use maestro_core::census::WorkspaceCensus;
use maestro_core::executor::{Executor, ProviderFactory, RunOutcome};
use maestro_core::feedback::OutcomeLogger;
use maestro_core::history::{HistoryStore, DEFAULT_WINDOW};
use maestro_core::recommend::{self, Recommender};
use maestro_core::roles::AgentRole;
use maestro_core::router::Router;
use maestro_core::task::Task;
use maestro_core::tools::default_registry;
use maestro_provider::{Catalog, Provider};

const EXIT_SUCCESS: u8 = 0;
const EXIT_FAIL: u8 = 1;
const EXIT_CANCELLED: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_NO_MODEL: u8 = 4;

#[derive(Parser)]
#[command(name = "maestro", version, about = "Agentic coding assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to config.toml (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to catalog.json (default: platform data dir)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a task to completion against the current directory
    Run {
        /// The task, in plain language
        task: String,

        /// Working directory (default: current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Summarize recorded executions per (backend, model)
    History {
        /// Number of trailing records to scan
        #[arg(long, default_value_t = DEFAULT_WINDOW)]
        limit: usize,
    },
    /// List catalog models with the current recommendation for a role
    Models {
        /// Agent role to rank for
        #[arg(long, default_value = "editor")]
        role: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let setup = match load_setup(cli.config.as_deref()) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let catalog = match &cli.catalog {
        Some(path) => match Catalog::load(path) {
            Ok(c) => c,
            Err(err) => {
                eprintln!("configuration error: cannot load catalog: {err:#}");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => Catalog::load_default(),
    };
    if let Err(err) = maestro_provider::validate_setup(&setup, &catalog) {
        eprintln!("configuration error: {err:#}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(EXIT_FAIL);
        }
    };

    match cli.command {
        Command::Run { task, workspace } => runtime.block_on(run_task(setup, catalog, task, workspace)),
        Command::History { limit } => report_history(limit),
        Command::Models { role } => report_models(setup, catalog, &role),
    }
}

fn load_setup(path: Option<&std::path::Path>) -> Result<Setup> {
    match path {
        Some(p) => Ok(Setup::load_from(p)?),
        None => Ok(Setup::load()?),
    }
}

async fn run_task(
    setup: Setup,
    catalog: Catalog,
    task_text: String,
    workspace: Option<PathBuf>,
) -> ExitCode {
    let workspace = workspace
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let task = Task::new(&task_text);
    let census = WorkspaceCensus::scan(&workspace);
    let router = Router::new(&setup);
    let plan = router.route(&task, &census);
    println!(
        "plan: {} ({:?}), {} attempt(s), layers {:?}",
        plan.kind, plan.class, plan.max_attempts, plan.validation_layers
    );

    let store = HistoryStore::new(HistoryStore::default_path());
    let recommender = Recommender::new(setup.clone(), catalog, store.clone());
    let logger = OutcomeLogger::new(store);

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("cancellation requested");
            ctrl_c_cancel.cancel();
        }
    });

    // Providers are built once per backend and shared across attempts.
    let cache: Mutex<HashMap<String, Arc<dyn Provider>>> = Mutex::new(HashMap::new());
    let factory: ProviderFactory = Box::new(move |backend: &str| {
        let mut cache = cache.lock().expect("provider cache poisoned");
        if let Some(provider) = cache.get(backend) {
            return Ok(provider.clone());
        }
        let provider: Arc<dyn Provider> =
            Arc::from(maestro_provider::create_provider(backend, &setup)?);
        cache.insert(backend.to_string(), provider.clone());
        Ok(provider)
    });

    let mut executor = Executor::new(
        recommender,
        logger,
        default_registry(),
        workspace,
        census,
        factory,
        cancel,
    );

    let report = executor.execute(&task, &plan).await;

    if !report.final_text.is_empty() {
        println!("{}", report.final_text);
    }
    if let Some(verdict) = &report.verdict {
        println!(
            "verdict: build={:?} review={:?} tests={:?} logs={:?} overall={:?}",
            verdict.build, verdict.review, verdict.tests, verdict.logs, verdict.overall
        );
        for detail in &verdict.details {
            println!("  {detail}");
        }
    }

    match report.outcome {
        RunOutcome::Success => {
            println!("done in {} attempt(s)", report.attempts);
            ExitCode::from(EXIT_SUCCESS)
        }
        RunOutcome::Partial => {
            println!("partial after {} attempt(s); artifacts kept", report.attempts);
            ExitCode::from(EXIT_FAIL)
        }
        RunOutcome::Fail => {
            let kind = report
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".into());
            eprintln!("failed after {} attempt(s): {kind}", report.attempts);
            ExitCode::from(EXIT_FAIL)
        }
        RunOutcome::Cancelled => {
            eprintln!("cancelled; partial artifacts kept");
            ExitCode::from(EXIT_CANCELLED)
        }
        RunOutcome::NoSuitableModel => {
            eprintln!("no suitable model: configure a backend or switch mode");
            ExitCode::from(EXIT_NO_MODEL)
        }
    }
}

fn report_history(limit: usize) -> ExitCode {
    let store = HistoryStore::new(HistoryStore::default_path());
    let perf = match store.model_performance(None, limit) {
        Ok(p) => p,
        Err(err) => {
            eprintln!("cannot read history: {err}");
            return ExitCode::from(EXIT_FAIL);
        }
    };

    if perf.is_empty() {
        println!("no recorded executions");
        return ExitCode::from(EXIT_SUCCESS);
    }

    let mut rows: Vec<_> = perf.into_iter().collect();
    rows.sort_by(|a, b| b.1.total_tasks.cmp(&a.1.total_tasks));

    println!(
        "{:<12} {:<28} {:>6} {:>8} {:>10} {:>20}",
        "backend", "model", "runs", "success", "avg ms", "last seen"
    );
    for ((backend, model), p) in rows {
        let last_seen = chrono::DateTime::from_timestamp(p.last_seen as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<12} {:<28} {:>6} {:>7.0}% {:>10} {:>20}",
            backend,
            model,
            p.total_tasks,
            p.success_rate() * 100.0,
            p.avg_latency_ms,
            last_seen
        );
    }
    ExitCode::from(EXIT_SUCCESS)
}

fn report_models(setup: Setup, catalog: Catalog, role: &str) -> ExitCode {
    let Some(role) = AgentRole::all().iter().find(|r| r.as_str() == role).copied() else {
        eprintln!("unknown role: {role}");
        return ExitCode::from(EXIT_CONFIG);
    };

    if catalog.is_empty() {
        println!("catalog is empty");
        return ExitCode::from(EXIT_SUCCESS);
    }

    let store = HistoryStore::new(HistoryStore::default_path());
    let mut recommender = Recommender::new(setup, catalog, store);
    let ranked = recommender.select(role, None, None);

    if recommend::is_ambiguous(&ranked) {
        println!("(top candidates are close; consider picking manually)");
    }
    println!(
        "{:<12} {:<28} {:>7} {:>7}  reason",
        "backend", "model", "score", "conf"
    );
    for r in ranked {
        println!(
            "{:<12} {:<28} {:>7.3} {:>7.2}  {}",
            r.backend, r.model, r.score, r.confidence, r.reason
        );
    }
    ExitCode::from(EXIT_SUCCESS)
}
