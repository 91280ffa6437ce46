use std::collections::{HashMap, HashSet};

use maestro_config::{Mode, Setup};
use maestro_provider::Catalog;

use crate::errors::ErrorKind;
use crate::history::{HistoryStore, DEFAULT_WINDOW};
use crate::roles::AgentRole;

/// Minimum observations before the observed success rate replaces the prior.
const MIN_OBSERVATIONS: usize = 3;
/// Flat prior for unseen (backend, model) pairs.
const PRIOR_SUCCESS_RATE: f64 = 0.5;
/// tps value that maps to a full speed score.
const SPEED_FULL_SCALE_TPS: f64 = 1000.0;

const WEIGHT_SUCCESS: f64 = 0.50;
const WEIGHT_SPEED: f64 = 0.20;
const WEIGHT_COST: f64 = 0.20;
const WEIGHT_AVAILABILITY: f64 = 0.10;

/// Penalty applied when a candidate shares the failed pair's backend, so
/// retries diversify across backends.
const SAME_BACKEND_PENALTY: f64 = 0.95;

/// Below this gap between the top two scores, the caller may prompt the user.
const AMBIGUITY_GAP: f64 = 0.10;

#[derive(Debug, Clone, Default)]
pub struct RecommendationMetrics {
    pub success_rate: f64,
    pub avg_latency_ms: u64,
    pub cost_per_1m: f64,
    pub speed_tps: f64,
    pub availability: f64,
}

#[derive(Debug, Clone)]
pub struct Recommendation {
    pub backend: String,
    pub model: String,
    pub score: f64,
    pub confidence: f64,
    pub reason: String,
    pub metrics: RecommendationMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    role: AgentRole,
    failed: Option<(String, String)>,
    min_context: Option<u32>,
}

/// Scores (backend, model) candidates for an agent role from the catalog,
/// the user's setup, and recent history. One instance lives per task; a
/// config reload means a new instance, which is the cache invalidation.
pub struct Recommender {
    setup: Setup,
    catalog: Catalog,
    store: HistoryStore,
    window: usize,
    penalized_backends: HashSet<String>,
    cache: HashMap<CacheKey, Vec<Recommendation>>,
}

impl Recommender {
    pub fn new(setup: Setup, catalog: Catalog, store: HistoryStore) -> Self {
        Self {
            setup,
            catalog,
            store,
            window: DEFAULT_WINDOW,
            penalized_backends: HashSet::new(),
            cache: HashMap::new(),
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Availability penalty for the rest of the run, applied after an
    /// `auth_failed` from a backend.
    pub fn penalize_backend(&mut self, backend_id: &str) {
        self.penalized_backends.insert(backend_id.to_string());
        self.cache.clear();
    }

    /// History advanced (a new record was written); cached rankings are stale.
    pub fn invalidate(&mut self) {
        self.cache.clear();
    }

    /// Ranked candidates for `role`, best first. Never empty: with no viable
    /// candidate it falls back to the configured default with confidence 0.
    pub fn select(
        &mut self,
        role: AgentRole,
        failed: Option<&(String, String)>,
        min_context: Option<u32>,
    ) -> Vec<Recommendation> {
        let key = CacheKey {
            role,
            failed: failed.cloned(),
            min_context,
        };
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let ranked = self.score_candidates(failed, min_context);
        let ranked = if ranked.is_empty() {
            vec![self.fallback_default(role)]
        } else {
            ranked
        };

        self.cache.insert(key, ranked.clone());
        ranked
    }

    fn score_candidates(
        &self,
        failed: Option<&(String, String)>,
        min_context: Option<u32>,
    ) -> Vec<Recommendation> {
        let perf = self
            .store
            .model_performance(None, self.window)
            .unwrap_or_default();
        let records = self.store.recent(self.window).unwrap_or_default();

        let mut rate_limits: HashMap<&str, usize> = HashMap::new();
        for record in &records {
            if record.error_kind == Some(ErrorKind::RateLimited) {
                *rate_limits.entry(record.backend.as_str()).or_default() += 1;
            }
        }

        let mode = self.setup.defaults.mode;
        let mut out = Vec::new();

        for backend_id in self.setup.backend_ids() {
            if !mode_matches(mode, backend_id) {
                continue;
            }
            for entry in self.catalog.for_backend(backend_id) {
                if failed.is_some_and(|(b, m)| b == backend_id && *m == entry.model_name) {
                    continue;
                }
                if min_context.is_some_and(|n| entry.context_window < n) {
                    continue;
                }

                let key = (backend_id.to_string(), entry.model_name.clone());
                let history = perf.get(&key);

                let (success_rate, confidence, reason) = match history {
                    Some(p) if p.total_tasks >= MIN_OBSERVATIONS => {
                        let rate = p.success_rate();
                        (
                            rate,
                            rate,
                            format!(
                                "observed success rate {:.2} over {} runs",
                                rate, p.total_tasks
                            ),
                        )
                    }
                    _ => (
                        PRIOR_SUCCESS_RATE,
                        PRIOR_SUCCESS_RATE,
                        format!("fewer than {MIN_OBSERVATIONS} runs, using prior"),
                    ),
                };

                let avg_latency_ms = history.map(|p| p.avg_latency_ms).unwrap_or(0);
                let speed = speed_score(entry.speed_tps, avg_latency_ms);
                let cost = cost_score(entry.cost_per_1m());

                let rl_count = rate_limits.get(backend_id).copied().unwrap_or(0);
                let mut availability = (1.0 - 0.2 * rl_count.min(4) as f64).max(0.0);
                if self.penalized_backends.contains(backend_id) {
                    availability *= 0.25;
                }

                let mut score = WEIGHT_SUCCESS * success_rate
                    + WEIGHT_SPEED * speed
                    + WEIGHT_COST * cost
                    + WEIGHT_AVAILABILITY * availability;
                if failed.is_some_and(|(b, _)| b == backend_id) {
                    score *= SAME_BACKEND_PENALTY;
                }

                out.push(Recommendation {
                    backend: backend_id.to_string(),
                    model: entry.model_name.clone(),
                    score,
                    confidence,
                    reason,
                    metrics: RecommendationMetrics {
                        success_rate,
                        avg_latency_ms,
                        cost_per_1m: entry.cost_per_1m(),
                        speed_tps: entry.speed_tps,
                        availability,
                    },
                });
            }
        }

        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.backend.as_str(), a.model.as_str()).cmp(&(b.backend.as_str(), b.model.as_str())))
        });
        out
    }

    fn fallback_default(&self, role: AgentRole) -> Recommendation {
        let (backend, model) = self.setup.default_pair(role.as_str());
        Recommendation {
            backend,
            model,
            score: 0.0,
            confidence: 0.0,
            reason: "fallback-default".to_string(),
            metrics: RecommendationMetrics::default(),
        }
    }
}

fn mode_matches(mode: Mode, backend_id: &str) -> bool {
    match mode {
        Mode::Local => backend_id == "ollama",
        Mode::Cloud => backend_id != "ollama",
        Mode::Hybrid => true,
    }
}

fn speed_score(speed_tps: f64, avg_latency_ms: u64) -> f64 {
    let tps = (speed_tps / SPEED_FULL_SCALE_TPS).clamp(0.0, 1.0);
    if avg_latency_ms > 0 {
        let latency = 1.0 - (avg_latency_ms as f64 / 10_000.0).clamp(0.0, 0.5);
        (tps + latency) / 2.0
    } else {
        tps
    }
}

fn cost_score(cost_per_1m: f64) -> f64 {
    if cost_per_1m == 0.0 {
        1.0
    } else {
        1.0 - (cost_per_1m / 2.0).clamp(0.0, 0.8)
    }
}

/// True when the top two scores are within the gap where the UI may prompt.
pub fn is_ambiguous(ranked: &[Recommendation]) -> bool {
    match ranked {
        [first, second, ..] => (first.score - second.score).abs() < AMBIGUITY_GAP,
        _ => false,
    }
}
