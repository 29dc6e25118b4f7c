use thiserror::Error;

/// Core error type for the active check agent.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Connect/send/recv failure talking to the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The wire reply did not parse as a valid tagged object tree.
    #[error("protocol parse error: {0}")]
    Protocol(String),

    /// Server replied with `{"response":"failed", ...}`.
    #[error("server reported failure: {0}")]
    ServerFailed(String),

    /// A `log[...]`/`logrt[...]`/`eventlog[...]` key failed to parse.
    #[error("invalid check key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Reading the underlying file/event source failed.
    #[error("log source error: {0}")]
    LogSource(String),

    /// Configuration is missing or out of range.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Protocol(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for CoreError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl CoreError {
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
