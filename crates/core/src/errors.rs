use maestro_provider::ProviderError;
use serde::{Deserialize, Serialize};

/// Failure classification shared by the agent loop, executor, and history
/// records. Kinds, not types: the same kind can originate from different
/// layers and is matched on for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    AuthFailed,
    RateLimited,
    ProviderTimeout,
    ProviderTransport,
    ToolNotAvailable,
    ToolExecutionError,
    LoopStuck,
    ContextOverflow,
    Cancelled,
    ValidationFailed,
}

impl ErrorKind {
    /// Recoverable kinds are handled locally by the executor via re-routing
    /// to an alternate (backend, model); everything else surfaces.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::ToolNotAvailable
                | ErrorKind::RateLimited
                | ErrorKind::ProviderTimeout
                | ErrorKind::ProviderTransport
                | ErrorKind::ContextOverflow
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ProviderTimeout => "provider_timeout",
            ErrorKind::ProviderTransport => "provider_transport",
            ErrorKind::ToolNotAvailable => "tool_not_available",
            ErrorKind::ToolExecutionError => "tool_execution_error",
            ErrorKind::LoopStuck => "loop_stuck",
            ErrorKind::ContextOverflow => "context_overflow",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ValidationFailed => "validation_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a provider failure onto the shared taxonomy.
pub fn classify_provider_error(err: &anyhow::Error) -> ErrorKind {
    match err.downcast_ref::<ProviderError>() {
        Some(ProviderError::AuthFailed(_)) => ErrorKind::AuthFailed,
        Some(ProviderError::RateLimited { .. }) => ErrorKind::RateLimited,
        Some(ProviderError::Timeout(_)) => ErrorKind::ProviderTimeout,
        Some(ProviderError::ToolsUnsupported(_)) => ErrorKind::ToolNotAvailable,
        Some(ProviderError::ContextOverflow(_)) => ErrorKind::ContextOverflow,
        Some(
            ProviderError::Transport(_) | ProviderError::Stream(_) | ProviderError::Http { .. },
        ) => ErrorKind::ProviderTransport,
        Some(ProviderError::Deserialization(_)) => ErrorKind::ProviderTransport,
        None => ErrorKind::ProviderTransport,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_set_matches_policy() {
        for kind in [
            ErrorKind::ToolNotAvailable,
            ErrorKind::RateLimited,
            ErrorKind::ProviderTimeout,
            ErrorKind::ProviderTransport,
            ErrorKind::ContextOverflow,
        ] {
            assert!(kind.is_recoverable(), "{kind} should be recoverable");
        }
        for kind in [
            ErrorKind::AuthFailed,
            ErrorKind::ToolExecutionError,
            ErrorKind::Cancelled,
            ErrorKind::LoopStuck,
            ErrorKind::ConfigError,
        ] {
            assert!(!kind.is_recoverable(), "{kind} should not be recoverable");
        }
    }

    #[test]
    fn classifies_provider_errors() {
        let err = anyhow::Error::from(ProviderError::ToolsUnsupported("x".into()));
        assert_eq!(classify_provider_error(&err), ErrorKind::ToolNotAvailable);
        let err = anyhow::Error::from(ProviderError::RateLimited { retry_after_ms: 5 });
        assert_eq!(classify_provider_error(&err), ErrorKind::RateLimited);
        let err = anyhow::anyhow!("opaque");
        assert_eq!(classify_provider_error(&err), ErrorKind::ProviderTransport);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ToolNotAvailable).unwrap();
        assert_eq!(json, "\"tool_not_available\"");
    }
}
