//! Public error type.
//!
//! The orchestrator is the only component that raises these; internal
//! failures (ledger degradation in particular) are logged and flagged rather
//! than surfaced. Provider safety blocks are NOT errors — they come back as
//! a successful response with `finish_reason = safety_blocked`.

use crate::config::ConfigError;
use crate::providers::ProviderError;

/// Errors surfaced to callers of the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No endpoint available for model '{alias}' (provider '{provider}')")]
    NoEndpoint { alias: String, provider: String },

    #[error("Unknown model alias '{0}'")]
    UnknownModel(String),

    #[error(
        "Daily budget exceeded: spent ${spent_usd:.4}, estimated ${estimated_usd:.4}, limit ${limit_usd:.4}"
    )]
    QuotaExceeded {
        spent_usd: f64,
        estimated_usd: f64,
        limit_usd: f64,
    },

    #[error("Rate limit exhausted for {provider}/{model}: {reason}")]
    RateLimited {
        provider: String,
        model: String,
        reason: String,
    },

    #[error("Wait ceiling exceeded after {waited_s:.1}s")]
    TimeoutExceeded { waited_s: f64 },

    #[error("Authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("Provider error: {0}")]
    Provider(ProviderError),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Authentication { provider, message } => {
                Self::Auth { provider, message }
            }
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Provider(other),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Ledger(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_provider_error_maps_to_auth() {
        let err: Error = ProviderError::Authentication {
            provider: "google".to_string(),
            message: "401".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn test_cancelled_provider_error_maps_to_cancelled() {
        let err: Error = ProviderError::Cancelled.into();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_other_provider_errors_wrap() {
        let err: Error = ProviderError::Api {
            status: 502,
            message: "bad gateway".to_string(),
        }
        .into();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[test]
    fn test_quota_display_includes_amounts() {
        let err = Error::QuotaExceeded {
            spent_usd: 0.99,
            estimated_usd: 0.05,
            limit_usd: 1.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("$0.9900"));
        assert!(msg.contains("$1.0000"));
    }
}
