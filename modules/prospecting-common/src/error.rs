use thiserror::Error;

/// Classified provider failure. Clients and the gateway map raw transport
/// errors into these; the retry policy keys off the classification.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Retryable: network failures, 5xx, 429 with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Not retried: 4xx (excluding 429), schema validation after repair.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// Provider quota exhausted. No further calls to this provider this run.
    #[error("quota exceeded for provider {0}")]
    QuotaExceeded(String),

    /// DNS/TCP/TLS failure reaching a site (browser renders).
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Navigation or idle timeout (browser renders).
    #[error("timed out: {0}")]
    Timeout(String),

    /// Site answered with 4xx/5xx (browser renders).
    #[error("blocked with status {status}: {url}")]
    Blocked { status: u16, url: String },

    /// Rate-limiter max wait elapsed before a token freed up.
    #[error("rate limit wait timed out for key {0}")]
    RateLimitTimeout(String),

    /// The run context was cancelled while waiting or executing.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the gateway retry loop should attempt this call again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::Timeout(_)
        )
    }

    /// Map an HTTP status into the taxonomy. 429 and 5xx retry; quota
    /// statuses stop the provider for the run; other 4xx fail fast.
    pub fn from_status(status: u16, provider: &str, body: &str) -> Self {
        match status {
            429 => ProviderError::Transient(format!("{provider} rate limited: {body}")),
            402 | 403 if body.to_lowercase().contains("quota") => {
                ProviderError::QuotaExceeded(provider.to_string())
            }
            s if s >= 500 => ProviderError::Transient(format!("{provider} returned {s}: {body}")),
            s => ProviderError::Permanent(format!("{provider} returned {s}: {body}")),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() {
            ProviderError::Unreachable(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Top-level engine failure. Per-prospect errors never surface here —
/// only conditions that abort the whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid brief: {0}")]
    Input(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("backup store error: {0}")]
    Backup(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("aborted after {streak} consecutive permanent provider failures: {last}")]
    ProviderStreak { streak: u32, last: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Transient("boom".into()).is_transient());
        assert!(ProviderError::Timeout("slow".into()).is_transient());
        assert!(!ProviderError::Permanent("bad request".into()).is_transient());
        assert!(!ProviderError::QuotaExceeded("maps".into()).is_transient());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            ProviderError::from_status(429, "maps", ""),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(503, "maps", ""),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(400, "maps", ""),
            ProviderError::Permanent(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, "maps", "daily quota exceeded"),
            ProviderError::QuotaExceeded(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, "maps", "forbidden"),
            ProviderError::Permanent(_)
        ));
    }
}
