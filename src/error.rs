//! Closed error taxonomy for the parts of the crate that cross an external
//! boundary (the Core API, the Gateway contract). Internal plumbing keeps
//! propagating `anyhow::Result` the way the rest of the crate does; this
//! enum is where that collapses into something callers can match on.

use thiserror::Error;

/// A closed error kind, matching the taxonomy in the runtime's error design.
#[derive(Debug, Error)]
pub enum PenguinError {
    #[error("config error: {0}")]
    Config(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("context length exceeded: used {used}, limit {limit}")]
    ContextLengthExceeded { used: usize, limit: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("tool refused: {0}")]
    ToolRefused(String),

    #[error("interrupted")]
    Interrupted,

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl PenguinError {
    /// Short, stable tag for `ProcessResult.error.kind` (see Core API, §6.3).
    pub fn kind(&self) -> &'static str {
        match self {
            PenguinError::Config(_) => "ConfigError",
            PenguinError::Auth(_) => "AuthError",
            PenguinError::RateLimit(_) => "RateLimit",
            PenguinError::Network(_) => "NetworkError",
            PenguinError::Provider(_) => "ProviderError",
            PenguinError::ContextLengthExceeded { .. } => "ContextLengthExceeded",
            PenguinError::InvalidRequest(_) => "InvalidRequest",
            PenguinError::Tool(_) => "ToolError",
            PenguinError::ToolRefused(_) => "ToolRefused",
            PenguinError::Interrupted => "Interrupted",
            PenguinError::Persistence(_) => "PersistenceError",
        }
    }

    /// Whether the Engine's retry policy should retry this error kind at
    /// all (§4.10: RateLimit/NetworkError/ProviderError retry; everything
    /// else named here is fatal for the turn).
    pub fn is_retryable(&self) -> bool {
        self.max_retries() > 0
    }

    /// Retry budget for this error kind (§7): RateLimit/NetworkError get the
    /// full exponential-backoff budget, ProviderError gets a single retry
    /// before surfacing, everything else is fatal.
    pub fn max_retries(&self) -> u32 {
        match self {
            PenguinError::RateLimit(_) | PenguinError::Network(_) => 3,
            PenguinError::Provider(_) => 1,
            _ => 0,
        }
    }
}

impl From<serde_json::Error> for PenguinError {
    fn from(e: serde_json::Error) -> Self {
        PenguinError::InvalidRequest(e.to_string())
    }
}

impl From<std::io::Error> for PenguinError {
    fn from(e: std::io::Error) -> Self {
        PenguinError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for PenguinError {
    fn from(e: config::ConfigError) -> Self {
        PenguinError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PenguinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_taxonomy() {
        assert_eq!(PenguinError::Auth("x".into()).kind(), "AuthError");
        assert_eq!(
            PenguinError::ContextLengthExceeded { used: 10, limit: 5 }.kind(),
            "ContextLengthExceeded"
        );
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(PenguinError::RateLimit("slow down".into()).is_retryable());
        assert!(!PenguinError::Auth("bad key".into()).is_retryable());
        assert!(!PenguinError::Interrupted.is_retryable());
    }

    #[test]
    fn provider_errors_get_a_single_retry() {
        let err = PenguinError::Provider("upstream hiccup".into());
        assert!(err.is_retryable());
        assert_eq!(err.max_retries(), 1);
        assert!(PenguinError::RateLimit("slow down".into()).max_retries() > 1);
    }
}
