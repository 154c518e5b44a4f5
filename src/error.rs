use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure of a single provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderErrorKind {
    Auth,
    RateLimited,
    Timeout,
    Unknown,
}

const AUTH_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "authentication",
    "api key",
    "api_key",
    "permission",
];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota",
];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline"];

impl ProviderErrorKind {
    /// Classify a raw provider message. Auth wins over rate limiting, which wins over timeouts.
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        let matches = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

        if matches(AUTH_MARKERS) {
            Self::Auth
        } else if matches(RATE_LIMIT_MARKERS) {
            Self::RateLimited
        } else if matches(TIMEOUT_MARKERS) {
            Self::Timeout
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate-limited",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a backend, classified once at the provider boundary
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Build an error whose kind is derived from the message text
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ProviderErrorKind::classify(&message),
            message,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }

    /// Only quota and rate-limit failures may be replaced by a recorded sample
    pub fn is_fallback_eligible(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }
}

/// Errors surfaced by the arena outside of a single model turn
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("judge reply could not be parsed: {0}")]
    JudgeParse(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("client disconnected")]
    Disconnected,
}

impl ArenaError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit_messages() {
        assert_eq!(
            ProviderErrorKind::classify("429 rate limited"),
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            ProviderErrorKind::classify("Invalid status code: 429 Too Many Requests"),
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            ProviderErrorKind::classify("You exceeded your current quota"),
            ProviderErrorKind::RateLimited
        );
    }

    #[test]
    fn test_classify_auth_messages() {
        assert_eq!(
            ProviderErrorKind::classify("Invalid status code: 401 Unauthorized"),
            ProviderErrorKind::Auth
        );
        assert_eq!(
            ProviderErrorKind::classify("Incorrect API key provided: sk-***"),
            ProviderErrorKind::Auth
        );
    }

    #[test]
    fn test_classify_timeout_and_unknown() {
        assert_eq!(
            ProviderErrorKind::classify("operation timed out"),
            ProviderErrorKind::Timeout
        );
        assert_eq!(
            ProviderErrorKind::classify("connection reset by peer"),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn test_only_rate_limit_is_fallback_eligible() {
        assert!(ProviderError::rate_limited("slow down").is_fallback_eligible());
        assert!(!ProviderError::auth("bad key").is_fallback_eligible());
        assert!(!ProviderError::timeout("120s").is_fallback_eligible());
        assert!(!ProviderError::unknown("boom").is_fallback_eligible());
    }

    #[test]
    fn test_provider_error_display_includes_kind() {
        let err = ProviderError::from_message("429 rate limited");
        assert_eq!(err.to_string(), "rate-limited: 429 rate limited");
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ProviderErrorKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate-limited\"");
    }
}
