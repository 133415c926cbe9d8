//! Error types for Switchboard.

use std::time::Duration;

/// Top-level error type for the proxy binary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metric store error: {0}")]
    Store(#[from] StoreError),

    #[error("Request error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Server error: {0}")]
    Server(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable metric store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open metric store at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

/// Classification of a failed request, surfaced to clients and recorded in
/// metrics. Each kind maps to exactly one HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    RateLimited,
    QueueTimeout,
    NoKeyAvailable,
    PoolExhausted,
    CircuitOpen,
    UpstreamError,
    UpstreamRateLimited,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    /// HTTP status code returned to the client for this kind.
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::RateLimited | ErrorKind::UpstreamRateLimited => 429,
            ErrorKind::QueueTimeout
            | ErrorKind::NoKeyAvailable
            | ErrorKind::PoolExhausted
            | ErrorKind::CircuitOpen => 503,
            ErrorKind::UpstreamError => 502,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Stable identifier used in metric records and error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::NoKeyAvailable => "no_key_available",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Whether a request that failed with this kind may be retried once
    /// (idempotent requests only; see the retry policy in the pipeline).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamError | ErrorKind::PoolExhausted | ErrorKind::NoKeyAvailable
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request-scoped failure on the proxy hot path.
///
/// Every variant maps to an [`ErrorKind`]; the pipeline records the kind in
/// metrics before the response leaves the process.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Malformed request: {reason}")]
    BadRequest { reason: String },

    #[error("Authentication failed: {reason}")]
    Unauthorized { reason: String },

    #[error("Not permitted: {reason}")]
    Forbidden { reason: String },

    #[error("Rate limited on scope {scope}, retry after {retry_after:?}")]
    RateLimited {
        scope: String,
        retry_after: Duration,
    },

    #[error("Sequential queue deadline exceeded for provider {provider}")]
    QueueTimeout { provider: String },

    #[error("No API key available for provider {provider}")]
    NoKeyAvailable { provider: String },

    #[error("Connection pool exhausted for origin {origin}")]
    PoolExhausted { origin: String },

    #[error("Circuit open for {provider}/{model}, next probe in {retry_after:?}")]
    CircuitOpen {
        provider: String,
        model: String,
        retry_after: Duration,
    },

    #[error("Upstream {provider} replied {status}: {message}")]
    Upstream {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Upstream {provider} rate limited, retry after {retry_after:?}")]
    UpstreamRateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("Internal error: {reason}")]
    Internal { reason: String },

    #[error("Upstream transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProxyError {
    /// Classify this error for metrics and the client response.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::BadRequest { .. } => ErrorKind::BadRequest,
            ProxyError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ProxyError::Forbidden { .. } => ErrorKind::Forbidden,
            ProxyError::RateLimited { .. } => ErrorKind::RateLimited,
            ProxyError::QueueTimeout { .. } => ErrorKind::QueueTimeout,
            ProxyError::NoKeyAvailable { .. } => ErrorKind::NoKeyAvailable,
            ProxyError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ProxyError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ProxyError::Upstream { .. } => ErrorKind::UpstreamError,
            ProxyError::UpstreamRateLimited { .. } => ErrorKind::UpstreamRateLimited,
            ProxyError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ProxyError::Internal { .. } => ErrorKind::Internal,
            ProxyError::Http(_) => ErrorKind::UpstreamError,
        }
    }

    /// `Retry-After` hint, where the failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProxyError::RateLimited { retry_after, .. } => Some(*retry_after),
            ProxyError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            ProxyError::UpstreamRateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for request-scoped operations.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_maps_to_a_valid_status() {
        let kinds = [
            ErrorKind::BadRequest,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::RateLimited,
            ErrorKind::QueueTimeout,
            ErrorKind::NoKeyAvailable,
            ErrorKind::PoolExhausted,
            ErrorKind::CircuitOpen,
            ErrorKind::UpstreamError,
            ErrorKind::UpstreamRateLimited,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Internal,
        ];
        for kind in kinds {
            let status = kind.status();
            assert!(
                (100..=599).contains(&status),
                "{kind} maps to out-of-range status {status}"
            );
        }
    }

    #[test]
    fn retryable_kinds_are_the_documented_three() {
        assert!(ErrorKind::UpstreamError.is_retryable());
        assert!(ErrorKind::PoolExhausted.is_retryable());
        assert!(ErrorKind::NoKeyAvailable.is_retryable());

        assert!(!ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(!ErrorKind::QueueTimeout.is_retryable());
        assert!(!ErrorKind::UpstreamRateLimited.is_retryable());
        assert!(!ErrorKind::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn proxy_error_kind_classification() {
        let err = ProxyError::RateLimited {
            scope: "session:abc".to_string(),
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(1)));

        let err = ProxyError::CircuitOpen {
            provider: "openai".to_string(),
            model: "gpt-x".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(err.kind().status(), 503);
    }

    #[test]
    fn error_display_mentions_context() {
        let err = ProxyError::Upstream {
            provider: "anthropic".to_string(),
            status: 500,
            message: "overloaded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("anthropic"), "should mention provider: {msg}");
        assert!(msg.contains("500"), "should mention status: {msg}");

        let err = ConfigError::MissingRequired {
            key: "providers".to_string(),
            hint: "add at least one provider".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("providers"), "should mention key: {msg}");
    }

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(ErrorKind::NoKeyAvailable.as_str(), "no_key_available");
        assert_eq!(
            ErrorKind::UpstreamRateLimited.as_str(),
            "upstream_rate_limited"
        );
        assert_eq!(ErrorKind::Internal.as_str(), "internal_error");
    }
}
