//! Enrichment failures. All but a rejected API key are record-local.

use std::time::Duration;

/// Why a completion attempt (or a whole title request) failed.
///
/// Apart from [`EnrichmentFailure::Unauthorized`], these never abort a run:
/// the enrichment layer turns them into `EnrichmentStatus::Failed` on the
/// record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichmentFailure {
    /// The attempt exceeded its wall-clock budget.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// HTTP 429, optionally with the server's `Retry-After`.
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// 2xx response without a usable title.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// HTTP 401/403: the API key was rejected. Fatal for the whole run.
    #[error("API key rejected (HTTP {status}): {body}")]
    Unauthorized { status: u16, body: String },

    /// Non-2xx, non-429 status (404 for retired models, 5xx, ...).
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection, TLS or body-read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Every candidate model used up its retry budget.
    #[error("all {models} model(s) exhausted after {attempts} attempt(s); last: {last}")]
    AllModelsExhausted {
        models: usize,
        attempts: u32,
        last: Box<EnrichmentFailure>,
    },
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}s", d.as_secs()),
        None => String::new(),
    }
}

impl EnrichmentFailure {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether retrying, or trying another model, cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Server-suggested wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-friendly label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Http { .. } => "http",
            Self::Transport(_) => "transport",
            Self::AllModelsExhausted { .. } => "all_models_exhausted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = EnrichmentFailure::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 7s");

        let err = EnrichmentFailure::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "rate limited");

        let err = EnrichmentFailure::Http {
            status: 404,
            body: "no such model".into(),
        };
        assert_eq!(err.to_string(), "HTTP 404: no such model");
    }

    #[test]
    fn exhausted_wraps_last_failure() {
        let err = EnrichmentFailure::AllModelsExhausted {
            models: 2,
            attempts: 6,
            last: Box::new(EnrichmentFailure::Transport("connection reset".into())),
        };
        assert!(err.to_string().contains("after 6 attempt(s)"));
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(err.kind(), "all_models_exhausted");
    }

    #[test]
    fn only_unauthorized_is_fatal() {
        let rejected = EnrichmentFailure::Unauthorized {
            status: 401,
            body: "invalid key".into(),
        };
        assert!(rejected.is_fatal());
        assert_eq!(rejected.kind(), "unauthorized");
        assert!(!EnrichmentFailure::Http { status: 404, body: String::new() }.is_fatal());
        assert!(!EnrichmentFailure::RateLimited { retry_after: None }.is_fatal());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let limited = EnrichmentFailure::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(limited.is_rate_limited());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(
            EnrichmentFailure::Timeout(Duration::from_secs(1)).retry_after(),
            None
        );
    }
}
