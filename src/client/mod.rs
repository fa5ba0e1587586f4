use async_trait::async_trait;
use thiserror::Error;

pub mod chat;

pub use chat::ChatCompletionsClient;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("model returned no completion")]
    EmptyResponse,

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Failures that may succeed on a later attempt: transport errors,
    /// timeouts, throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(err) => !err.is_builder() && !err.is_decode(),
            ClientError::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
            }
            ClientError::SerdeJson(_) | ClientError::EmptyResponse | ClientError::Config(_) => {
                false
            }
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Black-box text completion service used by the classifier.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider/model label for logs.
    fn name(&self) -> &str;

    /// Sends `prompt` and returns the raw completion text.
    async fn complete(&self, prompt: &str) -> ClientResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_transient() {
        let status = |code: u16| ClientError::HttpStatus {
            status: reqwest::StatusCode::from_u16(code).unwrap(),
            body: String::new(),
        };
        assert!(status(429).is_transient());
        assert!(status(503).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(401).is_transient());
        assert!(!status(400).is_transient());
        assert!(!ClientError::EmptyResponse.is_transient());
    }
}
