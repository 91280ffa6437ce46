use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("default backend `{0}` is not configured under [backends]")]
    UnknownDefaultBackend(String),
}

/// Inference mode: which backends are eligible for selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Only the local `ollama` backend.
    Local,
    /// Any backend except `ollama`.
    Cloud,
    /// Any configured backend.
    #[default]
    Hybrid,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Cloud => write!(f, "cloud"),
            Mode::Hybrid => write!(f, "hybrid"),
        }
    }
}

fn default_ml_complex_threshold() -> f64 {
    0.55
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_ml_complex_threshold")]
    pub ml_complex_threshold: f64,
    /// When false, `simple` tasks route to the guided pipeline instead of
    /// single-shot with auto-applied edits.
    #[serde(default)]
    pub auto_apply: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            backend: String::new(),
            model: String::new(),
            mode: Mode::Hybrid,
            ml_complex_threshold: default_ml_complex_threshold(),
            auto_apply: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Wire protocol family: "openai", "ollama", ... Used by the provider
    /// factory; unknown types surface as a configuration error there.
    #[serde(rename = "type", default)]
    pub backend_type: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_model: String,
    /// Alias -> canonical model name.
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// Per-role model overrides, keyed by role name ("router", "editor", ...).
    #[serde(default)]
    pub agent_models: HashMap<String, String>,
}

impl BackendEntry {
    /// Resolve an alias through the `models` table; unknown names pass through.
    pub fn canonical_model<'a>(&'a self, name: &'a str) -> &'a str {
        self.models.get(name).map(|s| s.as_str()).unwrap_or(name)
    }

    pub fn model_for_role(&self, role: &str) -> Option<&str> {
        self.agent_models
            .get(role)
            .map(|m| self.canonical_model(m))
    }
}

/// The loaded user configuration. Loaded once per task; changes on disk
/// mid-run are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Setup {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub backends: HashMap<String, BackendEntry>,
}

impl Setup {
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("maestro")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("maestro")
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default location. A missing file yields `Setup::default()`.
    pub fn load() -> Result<Self, SetupError> {
        let path = Self::default_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, SetupError> {
        let content = std::fs::read_to_string(path).map_err(|source| SetupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let setup: Setup = toml::from_str(&content).map_err(|source| SetupError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        setup.validate()?;
        Ok(setup)
    }

    fn validate(&self) -> Result<(), SetupError> {
        if !self.defaults.backend.is_empty() && !self.backends.contains_key(&self.defaults.backend)
        {
            return Err(SetupError::UnknownDefaultBackend(
                self.defaults.backend.clone(),
            ));
        }
        Ok(())
    }

    pub fn backend(&self, id: &str) -> Option<&BackendEntry> {
        self.backends.get(id)
    }

    pub fn backend_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(|s| s.as_str()).collect();
        ids.sort();
        ids
    }

    /// The configured fallback pair for a role: per-role override on the
    /// default backend if present, else the backend's default model, else the
    /// global default model.
    pub fn default_pair(&self, role: &str) -> (String, String) {
        let backend_id = self.defaults.backend.clone();
        if let Some(entry) = self.backends.get(&backend_id) {
            if let Some(model) = entry.model_for_role(role) {
                return (backend_id, model.to_string());
            }
            if !entry.default_model.is_empty() {
                let model = entry.canonical_model(&entry.default_model).to_string();
                return (backend_id, model);
            }
        }
        (backend_id, self.defaults.model.clone())
    }
}
