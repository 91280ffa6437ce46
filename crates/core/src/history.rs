use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// Default number of trailing records the recommender mines.
pub const DEFAULT_WINDOW: usize = 100;

/// One completed agent run. Append-only; field names are stable across
/// versions and future fields are additive, so readers ignore unknown keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub timestamp: u64,
    pub task_fingerprint: String,
    pub backend: String,
    pub model: String,
    pub agent_role: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: u64,
    pub tool_calls_count: u32,
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// Aggregate over the scanned window for one (backend, model) pair.
#[derive(Debug, Clone, Default)]
pub struct ModelPerformance {
    pub total_tasks: usize,
    pub successes: usize,
    pub avg_latency_ms: u64,
    pub last_seen: u64,
}

impl ModelPerformance {
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            0.0
        } else {
            self.successes as f64 / self.total_tasks as f64
        }
    }
}

/// Append-only JSONL store. Single writer under an advisory lock; readers see
/// the completed prefix and skip a torn trailing line.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        maestro_config::Setup::data_dir().join("history.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &ExecutionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let line = serde_json::to_string(record)?;
        let result = writeln!(file, "{line}").and_then(|_| file.flush());
        fs2::FileExt::unlock(&file)?;
        result?;
        Ok(())
    }

    /// The newest `limit` records, oldest first. Unparseable lines (including
    /// a torn trailing line from a crashed writer) are skipped.
    pub fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let records: Vec<ExecutionRecord> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    /// Per-(backend, model) aggregates over the newest `limit` records.
    /// Tolerates records naming models no longer in the catalog: aggregation
    /// never consults the catalog.
    pub fn model_performance(
        &self,
        model_filter: Option<&str>,
        limit: usize,
    ) -> Result<HashMap<(String, String), ModelPerformance>> {
        let mut perf: HashMap<(String, String), ModelPerformance> = HashMap::new();
        let mut latency_sums: HashMap<(String, String), u64> = HashMap::new();

        for record in self.recent(limit)? {
            if let Some(filter) = model_filter {
                if record.model != filter {
                    continue;
                }
            }
            let key = (record.backend.clone(), record.model.clone());
            let entry = perf.entry(key.clone()).or_default();
            entry.total_tasks += 1;
            if record.success {
                entry.successes += 1;
            }
            entry.last_seen = entry.last_seen.max(record.timestamp);
            *latency_sums.entry(key).or_default() += record.latency_ms;
        }

        for (key, entry) in perf.iter_mut() {
            entry.avg_latency_ms = latency_sums[key] / entry.total_tasks as u64;
        }
        Ok(perf)
    }

    /// Count of records in the window with the given error kind on a backend.
    /// Feeds the recommender's availability score.
    pub fn recent_errors(&self, backend: &str, kind: ErrorKind, limit: usize) -> Result<usize> {
        Ok(self
            .recent(limit)?
            .iter()
            .filter(|r| r.backend == backend && r.error_kind == Some(kind))
            .count())
    }

    /// Optional retention: when the file exceeds `max_bytes`, rewrite it with
    /// only the newest `keep` records. The rewrite goes through a temp file
    /// and rename so readers never observe a half-written store.
    pub fn rotate_if_over(&self, max_bytes: u64, keep: usize) -> Result<()> {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() <= max_bytes {
            return Ok(());
        }

        let records = self.recent(keep)?;
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            for record in &records {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
            file.flush()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!(kept = records.len(), "rotated history file");
        Ok(())
    }
}

pub fn now_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
