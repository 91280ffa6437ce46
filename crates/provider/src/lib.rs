pub mod catalog;
pub mod openai;
pub mod types;

mod error;

pub use catalog::{Catalog, CatalogEntry};
pub use error::ProviderError;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use maestro_config::Setup;

const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// The narrow capability the core sees of any LLM backend. Cancellation is
/// driven by the caller dropping the future or the request deadline firing.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>>;
}

/// Registry keyed by backend type. Concrete clients are leaf libraries; an
/// unknown type is a configuration error.
pub fn create_provider(backend_id: &str, setup: &Setup) -> Result<Box<dyn Provider>> {
    let entry = setup
        .backend(backend_id)
        .ok_or_else(|| anyhow::anyhow!("backend `{backend_id}` is not configured"))?;

    match entry.backend_type.as_str() {
        "openai" => {
            let base_url = entry
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("backend `{backend_id}` has no base_url"))?;
            Ok(Box::new(openai::OpenAICompatProvider::new(
                backend_id.to_string(),
                base_url,
                api_key_from_env(backend_id),
            )))
        }
        "ollama" => {
            let base_url = entry
                .base_url
                .clone()
                .unwrap_or_else(|| OLLAMA_BASE_URL.to_string());
            Ok(Box::new(openai::OpenAICompatProvider::new(
                backend_id.to_string(),
                base_url,
                None,
            )))
        }
        other => anyhow::bail!("unsupported backend type `{other}` for `{backend_id}`"),
    }
}

/// Cross-check the user's setup against the catalog: a per-role override
/// must name a model the catalog lists under the same backend. Skipped when
/// the catalog is empty (nothing to check against).
pub fn validate_setup(setup: &Setup, catalog: &Catalog) -> Result<()> {
    if catalog.is_empty() {
        return Ok(());
    }
    for (backend_id, entry) in &setup.backends {
        if catalog.for_backend(backend_id).next().is_none() {
            continue;
        }
        for (role, model) in &entry.agent_models {
            let canonical = entry.canonical_model(model);
            if catalog.find(backend_id, canonical).is_none() {
                anyhow::bail!(
                    "backend `{backend_id}` overrides role `{role}` with `{canonical}`, \
                     which the catalog does not list for that backend"
                );
            }
        }
    }
    Ok(())
}

/// Credentials come from the environment: `X_API_KEY` for backend id `x`.
fn api_key_from_env(backend_id: &str) -> Option<String> {
    let var = format!(
        "{}_API_KEY",
        backend_id.to_uppercase().replace('-', "_")
    );
    std::env::var(&var).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_with(backend_type: &str, base_url: Option<&str>) -> Setup {
        let mut setup = Setup::default();
        setup.backends.insert(
            "b".to_string(),
            maestro_config::BackendEntry {
                backend_type: backend_type.to_string(),
                base_url: base_url.map(String::from),
                default_model: "m".to_string(),
                ..Default::default()
            },
        );
        setup
    }

    #[test]
    fn unknown_backend_type_is_rejected() {
        let setup = setup_with("grpc", Some("http://x"));
        assert!(create_provider("b", &setup).is_err());
    }

    #[test]
    fn unconfigured_backend_is_rejected() {
        let setup = Setup::default();
        assert!(create_provider("ghost", &setup).is_err());
    }

    #[test]
    fn ollama_defaults_base_url() {
        let setup = setup_with("ollama", None);
        let provider = create_provider("b", &setup).unwrap();
        assert_eq!(provider.name(), "b");
    }

    #[test]
    fn role_overrides_must_exist_in_the_catalog() {
        let mut setup = setup_with("openai", Some("http://x"));
        setup
            .backends
            .get_mut("b")
            .unwrap()
            .agent_models
            .insert("editor".into(), "ghost-model".into());

        let catalog = Catalog::from_entries(vec![CatalogEntry {
            backend_id: "b".into(),
            model_name: "real-model".into(),
            context_window: 8_000,
            cost_per_1m_in: 0.0,
            cost_per_1m_out: 0.0,
            speed_tps: 10.0,
            supports_tools: true,
            supports_json: false,
            tags: vec![],
            recommended_for: vec!["editor".into()],
        }]);

        assert!(validate_setup(&setup, &catalog).is_err());

        setup
            .backends
            .get_mut("b")
            .unwrap()
            .agent_models
            .insert("editor".into(), "real-model".into());
        assert!(validate_setup(&setup, &catalog).is_ok());

        // An empty catalog leaves nothing to check against.
        assert!(validate_setup(&setup, &Catalog::default()).is_ok());
    }
}
