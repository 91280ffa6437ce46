use std::path::Path;

use serde::{Deserialize, Serialize};

/// One model as described by the local normalized catalog. Read-only during a
/// run; reloaded between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub backend_id: String,
    pub model_name: String,
    #[serde(default)]
    pub context_window: u32,
    #[serde(default)]
    pub cost_per_1m_in: f64,
    #[serde(default)]
    pub cost_per_1m_out: f64,
    #[serde(default)]
    pub speed_tps: f64,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_json: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub recommended_for: Vec<String>,
}

impl CatalogEntry {
    /// Blended per-million cost used by the recommender's cost score.
    pub fn cost_per_1m(&self) -> f64 {
        (self.cost_per_1m_in + self.cost_per_1m_out) / 2.0
    }

    pub fn recommends_role(&self, role: &str) -> bool {
        self.recommended_for.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let entries = entries
            .into_iter()
            .filter(|e| {
                if e.recommended_for.is_empty() {
                    tracing::warn!(
                        backend = %e.backend_id,
                        model = %e.model_name,
                        "catalog entry advertises no roles, skipping"
                    );
                    false
                } else {
                    true
                }
            })
            .collect();
        Self { entries }
    }

    /// Load a JSON array of entries. Malformed elements and elements breaking
    /// the roles invariant are skipped, not fatal; unknown fields are ignored.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let raw: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        let mut entries = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<CatalogEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(err) => tracing::warn!(%err, "skipping malformed catalog entry"),
            }
        }
        Ok(Self::from_entries(entries))
    }

    /// Load from the default location; a missing file yields an empty catalog.
    pub fn load_default() -> Self {
        let path = maestro_config::Setup::data_dir().join("catalog.json");
        if !path.exists() {
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|err| {
            tracing::warn!(%err, path = %path.display(), "failed to load catalog");
            Self::default()
        })
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, backend_id: &str, model_name: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.backend_id == backend_id && e.model_name == model_name)
    }

    pub fn for_backend<'a>(
        &'a self,
        backend_id: &'a str,
    ) -> impl Iterator<Item = &'a CatalogEntry> {
        self.entries.iter().filter(move |e| e.backend_id == backend_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(backend: &str, model: &str) -> CatalogEntry {
        CatalogEntry {
            backend_id: backend.into(),
            model_name: model.into(),
            context_window: 128_000,
            cost_per_1m_in: 1.0,
            cost_per_1m_out: 3.0,
            speed_tps: 80.0,
            supports_tools: true,
            supports_json: true,
            tags: vec![],
            recommended_for: vec!["editor".into()],
        }
    }

    #[test]
    fn blended_cost() {
        assert_eq!(entry("x", "m").cost_per_1m(), 2.0);
    }

    #[test]
    fn entries_without_roles_are_dropped() {
        let mut bad = entry("x", "m2");
        bad.recommended_for.clear();
        let catalog = Catalog::from_entries(vec![entry("x", "m1"), bad]);
        assert_eq!(catalog.entries().len(), 1);
        assert!(catalog.find("x", "m1").is_some());
        assert!(catalog.find("x", "m2").is_none());
    }

    #[test]
    fn load_skips_malformed_and_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[
                {"backend_id": "y", "model_name": "kimi-free",
                 "supports_tools": true, "recommended_for": ["editor"],
                 "some_future_field": {"nested": true}},
                {"model_name": "missing-backend"},
                "not even an object"
            ]"#,
        )
        .unwrap();
        let catalog = Catalog::load(&path).unwrap();
        assert_eq!(catalog.entries().len(), 1);
        assert!(catalog.find("y", "kimi-free").unwrap().supports_tools);
    }
}
