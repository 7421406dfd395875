use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrowserlessError>;

#[derive(Debug, Error)]
pub enum BrowserlessError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// DNS/TCP/TLS failure reaching the target site.
    #[error("Target unreachable: {0}")]
    Unreachable(String),

    /// Navigation or idle timeout.
    #[error("Navigation timed out: {0}")]
    Timeout(String),

    /// Target answered with a 4xx/5xx status.
    #[error("Target blocked with status {status}: {url}")]
    Blocked { status: u16, url: String },
}

impl From<reqwest::Error> for BrowserlessError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BrowserlessError::Timeout(err.to_string())
        } else {
            BrowserlessError::Network(err.to_string())
        }
    }
}

/// Classify a Browserless navigation failure message into the error
/// taxonomy. The service surfaces Chromium net errors verbatim.
pub(crate) fn classify_navigation_error(status: u16, message: &str, url: &str) -> BrowserlessError {
    let lower = message.to_lowercase();
    if lower.contains("net::err_name_not_resolved")
        || lower.contains("net::err_connection")
        || lower.contains("net::err_cert")
        || lower.contains("net::err_ssl")
    {
        return BrowserlessError::Unreachable(message.to_string());
    }
    if lower.contains("timeout") || lower.contains("timed out") {
        return BrowserlessError::Timeout(message.to_string());
    }
    if let Some(code) = extract_http_status(&lower) {
        return BrowserlessError::Blocked {
            status: code,
            url: url.to_string(),
        };
    }
    BrowserlessError::Api {
        status,
        message: message.to_string(),
    }
}

/// Pull an HTTP status code out of messages like "page responded with status 403".
fn extract_http_status(message: &str) -> Option<u16> {
    let idx = message.find("status")?;
    message[idx..]
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| s.len() == 3)
        .and_then(|s| s.parse().ok())
        .filter(|code| (400..600).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_failure_is_unreachable() {
        let err = classify_navigation_error(
            500,
            "net::ERR_NAME_NOT_RESOLVED at https://nope.example",
            "https://nope.example",
        );
        assert!(matches!(err, BrowserlessError::Unreachable(_)));
    }

    #[test]
    fn navigation_timeout_is_timeout() {
        let err =
            classify_navigation_error(500, "Navigation timeout of 30000 ms exceeded", "https://x");
        assert!(matches!(err, BrowserlessError::Timeout(_)));
    }

    #[test]
    fn http_error_status_is_blocked() {
        let err = classify_navigation_error(
            500,
            "page responded with status 403",
            "https://blocked.example",
        );
        match err {
            BrowserlessError::Blocked { status, url } => {
                assert_eq!(status, 403);
                assert_eq!(url, "https://blocked.example");
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn unknown_failure_falls_back_to_api() {
        let err = classify_navigation_error(502, "something odd", "https://x");
        assert!(matches!(err, BrowserlessError::Api { status: 502, .. }));
    }
}
