use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy exposed across the engine's public operations. Raw transport
/// or driver errors never cross this boundary, only these kinds.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Socket-level failure (reset, timeout, abort). Retried automatically up
    /// to the retry budget before being surfaced.
    #[error("Transport error: {0}")]
    Transport(String),
    /// The account lacks OAuth2 capability. Never retried.
    #[error("Account does not support OAuth2 authentication")]
    AuthUnsupported,
    /// The account broker could not mint an access token.
    #[error("Access token unavailable: {0}")]
    TokenUnavailable(String),
    /// Server returned NO/BAD for a well-formed command.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Malformed protocol payload. Degrades to partial fields, never fatal to
    /// a whole batch.
    #[error("Parse error: {0}")]
    Parse(String),
    /// Cache I/O failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

impl EngineError {
    /// True for failures worth a reconnect-and-retry: transport errors, plus
    /// protocol errors whose text indicates a desynchronized session (command
    /// issued after logout, response out of step with the pipeline). The
    /// substring match should be replaced with a structured protocol-state
    /// check if the transport ever exposes one.
    pub fn is_retryable_transport(&self) -> bool {
        match self {
            EngineError::Transport(_) => true,
            EngineError::Protocol(text) => {
                let lower = text.to_ascii_lowercase();
                lower.contains("unexpected response")
                    || lower.contains("illegal state")
                    || lower.contains("not connected")
                    || lower.contains("logout")
            }
            _ => false,
        }
    }
}
