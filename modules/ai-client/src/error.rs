use thiserror::Error;

pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Response did not conform to the requested schema, even after the
    /// repair re-prompt.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Empty response from model")]
    Empty,
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AiError::Timeout(err.to_string())
        } else {
            AiError::Network(err.to_string())
        }
    }
}
