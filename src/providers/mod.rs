//! Provider adapter contract and error taxonomy.
//!
//! Adapters translate the core's request/response model into a vendor wire
//! protocol. They authenticate, normalise usage into [`TokenUsage`], and map
//! vendor failures into [`ProviderError`] so the retry engine can classify
//! them uniformly. Adapters never write to the ledger.
//!
//! [`TokenUsage`]: crate::types::TokenUsage

pub mod echo;
pub mod traits;

use std::time::Duration;

pub use self::echo::EchoAdapter;
pub use self::traits::ProviderAdapter;

/// Errors surfaced by provider adapters.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited by provider")]
    RateLimited {
        /// Parsed retry-after hint from provider headers, if present.
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for {provider}: {message}")]
    Authentication { provider: String, message: String },

    #[error("Request blocked by provider safety filter: {message}")]
    SafetyBlocked { message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// Retry classification of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient transport or server failure; retry with back-off.
    Retryable,
    /// Provider throttling; wait if the policy allows, else surface.
    RateLimited,
    /// Permanent failure; surface immediately.
    Fatal,
    /// Caller cancelled; propagate without retrying.
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::RateLimited => "rate_limited",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }
}

impl ProviderError {
    /// Classify this error for the retry engine.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Api { status, .. } => match status {
                429 => ErrorClass::RateLimited,
                408 => ErrorClass::Retryable,
                500..=599 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            Self::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::Timeout(_) | Self::Stream(_) => ErrorClass::Retryable,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Authentication { .. }
            | Self::SafetyBlocked { .. }
            | Self::InvalidRequest(_)
            | Self::ResponseParsing(_)
            | Self::Other(_) => ErrorClass::Fatal,
        }
    }

    /// Provider-supplied retry-after hint, if this is a throttling error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short tag persisted in retry/commit event metadata.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Self::Http(_) => "http",
            Self::Api { .. } => "api",
            Self::RateLimited { .. } => "rate_limited",
            Self::Authentication { .. } => "auth",
            Self::SafetyBlocked { .. } => "safety",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Timeout(_) => "timeout",
            Self::Stream(_) => "stream",
            Self::ResponseParsing(_) => "parse",
            Self::Cancelled => "cancelled",
            Self::Other(_) => "other",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
