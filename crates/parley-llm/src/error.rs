use std::time::Duration;

/// Failures talking to a model provider.
/// Never leaves the crate as a value: the adapter turns it into an `error` event.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no API key configured for {0}")]
    MissingCredentials(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("rate limited")]
    RateLimited,
    #[error("provider overloaded")]
    Overloaded,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("idle timeout after {0:?}")]
    IdleTimeout(Duration),
    #[error("malformed stream payload: {0}")]
    Decode(String),
    /// Error object reported inside an otherwise successful stream.
    #[error("provider error: {0}")]
    Remote(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited,
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::UnexpectedStatus { status, body },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::Overloaded
                | Self::ServerError { .. }
                | Self::Network(_)
                | Self::StreamInterrupted(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials(_) => "missing_credentials",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited => "rate_limited",
            Self::Overloaded => "provider_overloaded",
            Self::ServerError { .. } => "server_error",
            Self::UnexpectedStatus { .. } => "unexpected_status",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::IdleTimeout(_) => "idle_timeout",
            Self::Decode(_) => "decode",
            Self::Remote(_) => "remote",
            Self::Config(_) => "config",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}
