use serde::{Deserialize, Serialize};

use crate::census::WorkspaceCensus;
use crate::classifier::{self, Classifier};
use crate::roles::AgentRole;
use crate::task::Task;
use crate::validate::Layer;

/// Phrases that signal an ordered sequence of sub-tasks.
const MULTI_STEP_CUES: &[&str] = &["then", "and then", "after", "followed by", "first", "second"];

/// Domain words that almost always mean real engineering effort.
const COMPLEX_CUES: &[&str] = &[
    "oauth",
    "migrate",
    "deploy",
    "docker",
    "k8s",
    "terraform",
    "kafka",
    "payment",
    "pipeline",
];

const MULTI_STEP_CUE_WEIGHT: f32 = 1.0;
const COMPLEX_CUE_WEIGHT: f32 = 1.5;

/// Heuristic fallback threshold when no classifier is available.
const FALLBACK_COMPLEX_WEIGHT: f32 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskClass {
    Trivial,
    Simple,
    Complex,
    Multistep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    SingleShot,
    Guided,
    Autonomous,
    Symphony,
}

impl std::fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineKind::SingleShot => write!(f, "single-shot"),
            PipelineKind::Guided => write!(f, "guided"),
            PipelineKind::Autonomous => write!(f, "autonomous"),
            PipelineKind::Symphony => write!(f, "symphony"),
        }
    }
}

/// The router's decision about how to execute a task.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub kind: PipelineKind,
    pub class: TaskClass,
    pub agents: Vec<AgentRole>,
    pub max_attempts: u32,
    pub validation_layers: Vec<Layer>,
    /// When set, the recommender is queried per role within an attempt
    /// instead of once for the whole attempt.
    pub per_role_selection: bool,
}

pub struct Router {
    classifier: Option<Classifier>,
    complex_threshold: f64,
    auto_apply: bool,
}

impl Router {
    pub fn new(setup: &maestro_config::Setup) -> Self {
        let classifier = match external_classifier_path() {
            Some(path) => match Classifier::load(&path) {
                Ok(clf) => Some(clf),
                Err(err) => {
                    tracing::warn!(%err, "external classifier unreadable, using embedded table");
                    Some(Classifier::embedded())
                }
            },
            None => Some(Classifier::embedded()),
        };
        Self {
            classifier,
            complex_threshold: setup.defaults.ml_complex_threshold,
            auto_apply: setup.defaults.auto_apply,
        }
    }

    /// Pure-heuristic router, used when no classifier table is usable. Also
    /// what tests use to pin down cue behavior without classifier weights in
    /// the mix.
    pub fn heuristics_only(setup: &maestro_config::Setup) -> Self {
        Self {
            classifier: None,
            complex_threshold: setup.defaults.ml_complex_threshold,
            auto_apply: setup.defaults.auto_apply,
        }
    }

    /// Router errors never fail the task: this always yields a plan.
    pub fn route(&self, task: &Task, census: &WorkspaceCensus) -> PipelinePlan {
        let class = self.classify(task);
        let plan = build_plan(class, self.auto_apply, census);
        tracing::debug!(
            class = ?plan.class,
            kind = %plan.kind,
            attempts = plan.max_attempts,
            "routed task"
        );
        plan
    }

    pub fn classify(&self, task: &Task) -> TaskClass {
        let (multi_weight, complex_weight) = cue_weights(&task.text);

        match &self.classifier {
            Some(clf) => {
                let mut logits = clf.logits(&task.text);
                logits[classifier::MULTISTEP] += multi_weight;
                logits[classifier::COMPLEX] += complex_weight;

                let probs = softmax(logits);
                let (argmax, prob) = probs
                    .iter()
                    .enumerate()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(i, p)| (i, *p))
                    .unwrap_or((classifier::SIMPLE, 1.0));

                // Heavy pipelines need confidence; below threshold, degrade to
                // the guided path.
                match argmax {
                    classifier::TRIVIAL => TaskClass::Trivial,
                    classifier::COMPLEX if f64::from(prob) >= self.complex_threshold => {
                        TaskClass::Complex
                    }
                    classifier::MULTISTEP if f64::from(prob) >= self.complex_threshold => {
                        TaskClass::Multistep
                    }
                    _ => TaskClass::Simple,
                }
            }
            None => {
                if multi_weight > 0.0 {
                    TaskClass::Multistep
                } else if complex_weight >= FALLBACK_COMPLEX_WEIGHT {
                    TaskClass::Complex
                } else if task.features.word_count <= 6 && task.features.file_refs.is_empty() {
                    TaskClass::Trivial
                } else {
                    TaskClass::Simple
                }
            }
        }
    }
}

fn cue_weights(text: &str) -> (f32, f32) {
    let lower = text.to_lowercase();
    let padded = format!(" {} ", lower.split_whitespace().collect::<Vec<_>>().join(" "));

    let multi = MULTI_STEP_CUES
        .iter()
        .filter(|cue| padded.contains(&format!(" {cue} ")))
        .count() as f32
        * MULTI_STEP_CUE_WEIGHT;

    let complex = COMPLEX_CUES
        .iter()
        .filter(|cue| lower.contains(*cue))
        .count() as f32
        * COMPLEX_CUE_WEIGHT;

    (multi, complex)
}

fn softmax(logits: [f32; 4]) -> [f32; 4] {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps = logits.map(|l| (l - max).exp());
    let sum: f32 = exps.iter().sum();
    exps.map(|e| e / sum)
}

fn build_plan(class: TaskClass, auto_apply: bool, census: &WorkspaceCensus) -> PipelinePlan {
    let plan = match class {
        TaskClass::Trivial => PipelinePlan {
            kind: PipelineKind::SingleShot,
            class,
            agents: vec![AgentRole::Editor],
            max_attempts: 1,
            validation_layers: vec![Layer::Build],
            per_role_selection: false,
        },
        TaskClass::Simple => PipelinePlan {
            kind: if auto_apply {
                PipelineKind::SingleShot
            } else {
                PipelineKind::Guided
            },
            class,
            agents: vec![AgentRole::Editor],
            max_attempts: 1,
            validation_layers: vec![Layer::Build, Layer::Logs],
            per_role_selection: false,
        },
        TaskClass::Complex => {
            let mut layers = vec![Layer::Build, Layer::Review];
            if census.has_test_runner() {
                layers.push(Layer::Tests);
            }
            layers.push(Layer::Logs);
            PipelinePlan {
                kind: PipelineKind::Autonomous,
                class,
                agents: vec![AgentRole::Editor],
                max_attempts: 3,
                validation_layers: layers,
                per_role_selection: false,
            }
        }
        TaskClass::Multistep => {
            let mut layers = vec![Layer::Build, Layer::Review];
            if census.has_test_runner() {
                layers.push(Layer::Tests);
            }
            layers.push(Layer::Logs);
            PipelinePlan {
                kind: PipelineKind::Symphony,
                class,
                agents: vec![AgentRole::Planner, AgentRole::Editor],
                max_attempts: 3,
                validation_layers: layers,
                per_role_selection: true,
            }
        }
    };
    debug_assert!((1..=5).contains(&plan.max_attempts));
    plan
}

fn external_classifier_path() -> Option<std::path::PathBuf> {
    let path = maestro_config::Setup::data_dir().join("classifier.json");
    path.exists().then_some(path)
}
