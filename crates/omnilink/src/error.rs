//! Error taxonomy for the bridge.

use std::time::Duration;

/// Errors surfaced to callers of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Byte-stream level read or write failure.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// No response arrived within the deadline.
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Malformed frame or unparsable JSON.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with `success: false`.
    #[error("server error: {0}")]
    Server(String),

    /// Rejected by an open circuit breaker; no attempt was made.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The request was cancelled by shutdown.
    #[error("request cancelled: {0}")]
    Cancelled(String),

    /// Submit was called after shutdown.
    #[error("bridge is not running")]
    NotRunning,
}

/// Discriminant of [`BridgeError`], for classification tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Protocol,
    Server,
    CircuitOpen,
    Cancelled,
    NotRunning,
}

impl BridgeError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Server(_) => ErrorKind::Server,
            Self::CircuitOpen => ErrorKind::CircuitOpen,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NotRunning => ErrorKind::NotRunning,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
