#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    Http { status: u16, body: String },

    #[error("authentication rejected: {0}")]
    AuthFailed(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("model does not support tool calling: {0}")]
    ToolsUnsupported(String),

    #[error("context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("SSE stream error: {0}")]
    Stream(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl ProviderError {
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        match status {
            401 | 403 => ProviderError::AuthFailed(body),
            429 => {
                let retry_after_ms = retry_after
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .map(|secs| (secs * 1000.0) as u64)
                    .unwrap_or(1_000);
                ProviderError::RateLimited { retry_after_ms }
            }
            408 | 504 => ProviderError::Timeout(body),
            400 | 413 if mentions_context_overflow(&body) => ProviderError::ContextOverflow(body),
            400 if mentions_tools_unsupported(&body) => ProviderError::ToolsUnsupported(body),
            _ => ProviderError::Http { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Transport(_)
            | ProviderError::Stream(_) => true,
            ProviderError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

fn mentions_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context length")
        || lower.contains("context window")
        || lower.contains("maximum context")
        || lower.contains("too many tokens")
}

fn mentions_tools_unsupported(body: &str) -> bool {
    let lower = body.to_lowercase();
    (lower.contains("tool") || lower.contains("function"))
        && (lower.contains("not support") || lower.contains("unsupported"))
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_statuses() {
        assert!(matches!(
            ProviderError::from_http(401, "bad key".into(), None),
            ProviderError::AuthFailed(_)
        ));
        assert!(matches!(
            ProviderError::from_http(429, String::new(), Some("2")),
            ProviderError::RateLimited {
                retry_after_ms: 2000
            }
        ));
        assert!(matches!(
            ProviderError::from_http(400, "maximum context length is 8192 tokens".into(), None),
            ProviderError::ContextOverflow(_)
        ));
        assert!(matches!(
            ProviderError::from_http(400, "this model does not support tools".into(), None),
            ProviderError::ToolsUnsupported(_)
        ));
    }

    #[test]
    fn retryability() {
        assert!(ProviderError::RateLimited { retry_after_ms: 0 }.is_retryable());
        assert!(ProviderError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::AuthFailed("nope".into()).is_retryable());
        assert!(!ProviderError::ToolsUnsupported("nope".into()).is_retryable());
    }
}
