use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no pipeline registered for packet type '{kind}' or any of its ancestors")]
    Unregistered { kind: &'static str },

    #[error("cache has been disposed")]
    Disposed,

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Returns `true` for errors raised by a cancelled dispatch.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
