use thiserror::Error;

/// Errors surfaced by the gateway and orchestrator. All of these are terminal
/// for the call that produced them -- retryable conditions (rate limits,
/// network drops) are resolved inside the gateway before one of these
/// escapes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The provider rejected the request body (HTTP 400). In practice this
    /// means the API key is invalid or expired.
    #[error("API key is invalid or expired. Check your key.")]
    InvalidCredential,

    /// HTTP 429 persisted through every retry attempt.
    #[error("Request limit reached. Wait a few seconds and try again.")]
    RateLimited,

    /// HTTP 404 -- the configured model does not exist or the key cannot
    /// access it.
    #[error("Model not available. Check your API key and model name.")]
    ModelUnavailable,

    /// Any other non-2xx response. Carries the provider's own error message
    /// when the body had one, else a status-derived message.
    #[error("{0}")]
    Provider(String),

    /// The request could not be sent or completed, after all retries.
    #[error("Network error: {0}")]
    Transport(String),

    /// Another analyze/chat call is already in flight for this session.
    #[error("Wait for the previous response to finish.")]
    Busy,
}
