/// Errors from model provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Neither provider key is set.
    #[error("No LLM provider configured. Set OPENROUTER_API_KEY (preferred) or ANTHROPIC_API_KEY.")]
    NotConfigured,

    /// Transport failure or a server-side (5xx) error.
    #[error("{provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    /// HTTP 429.
    #[error("{provider} rate limited")]
    RateLimited { provider: String },

    /// The body could not be decoded.
    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// A client-side rejection (4xx other than 429). Retrying will not help.
    #[error("{provider} rejected the request (HTTP {status}): {reason}")]
    Rejected {
        provider: String,
        status: u16,
        reason: String,
    },

    /// Every model in the fallback chain failed.
    #[error("All models failed. Last error: {last}")]
    Exhausted { last: String },
}

impl ProviderError {
    /// Whether the next model in a fallback chain is worth trying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestFailed { .. } | Self::RateLimited { .. } | Self::InvalidResponse { .. }
        )
    }

    /// Maps a non-success HTTP status to an error.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let reason = crate::agent::truncate(body, 512).to_string();
        match status {
            429 => Self::RateLimited {
                provider: provider.to_string(),
            },
            500..=599 => Self::RequestFailed {
                provider: provider.to_string(),
                reason: format!("HTTP {status}: {reason}"),
            },
            _ => Self::Rejected {
                provider: provider.to_string(),
                status,
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ProviderError::from_status("openrouter", 429, ""),
            ProviderError::RateLimited { .. }
        ));
        assert!(ProviderError::from_status("openrouter", 503, "overloaded").is_retryable());
        let rejected = ProviderError::from_status("anthropic", 401, "invalid x-api-key");
        assert!(!rejected.is_retryable());
        assert_eq!(
            rejected.to_string(),
            "anthropic rejected the request (HTTP 401): invalid x-api-key"
        );
    }

    #[test]
    fn test_not_configured_message() {
        assert_eq!(
            ProviderError::NotConfigured.to_string(),
            "No LLM provider configured. Set OPENROUTER_API_KEY (preferred) or ANTHROPIC_API_KEY."
        );
        assert!(!ProviderError::NotConfigured.is_retryable());
        assert!(!ProviderError::Exhausted { last: "x".into() }.is_retryable());
    }
}
