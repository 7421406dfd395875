use thiserror::Error;

pub type Result<T> = std::result::Result<T, MapsError>;

#[derive(Debug, Error)]
pub enum MapsError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Provider answered but with a non-OK application status.
    #[error("Maps API status {status}: {message}")]
    Api { status: String, message: String },

    /// Daily quota or QPS ceiling exhausted.
    #[error("Maps quota exceeded")]
    Quota,

    /// Key rejected or request malformed. Not retryable.
    #[error("Maps request denied: {0}")]
    Denied(String),
}

impl MapsError {
    /// Map the provider's application-level status string.
    pub(crate) fn from_api_status(status: &str, message: Option<&str>) -> Option<MapsError> {
        let message = message.unwrap_or("").to_string();
        match status {
            "OK" | "ZERO_RESULTS" => None,
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => Some(MapsError::Quota),
            "REQUEST_DENIED" | "INVALID_REQUEST" => Some(MapsError::Denied(message)),
            other => Some(MapsError::Api {
                status: other.to_string(),
                message,
            }),
        }
    }
}

impl From<reqwest::Error> for MapsError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MapsError::Timeout(err.to_string())
        } else {
            MapsError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_and_zero_results_are_not_errors() {
        assert!(MapsError::from_api_status("OK", None).is_none());
        assert!(MapsError::from_api_status("ZERO_RESULTS", None).is_none());
    }

    #[test]
    fn quota_statuses_map_to_quota() {
        assert!(matches!(
            MapsError::from_api_status("OVER_QUERY_LIMIT", None),
            Some(MapsError::Quota)
        ));
    }

    #[test]
    fn denied_is_not_retryable_shape() {
        assert!(matches!(
            MapsError::from_api_status("REQUEST_DENIED", Some("bad key")),
            Some(MapsError::Denied(_))
        ));
    }
}
