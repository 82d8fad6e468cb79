/// Riptide Error Types
///
/// One taxonomy for every core operation: registration, broadcast,
/// per-connection I/O and queue management.
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Riptide operations
#[derive(Error, Debug)]
pub enum RiptideError {
    /// Nil/zero/malformed input from the host
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Unknown conn id, group id, uri or property key
    #[error("not found: {0}")]
    NotFound(String),

    /// Double registration of a uri or group
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation on a closed connector, bucket, group or queue
    #[error("closed")]
    Closed,

    /// Enqueue on a write queue that is shutting down
    #[error("write queue closed")]
    QueueClosed,

    /// Non-blocking enqueue on a write queue at capacity
    #[error("write queue full")]
    QueueFull,

    /// Deadline expiry on a socket operation
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Underlying socket error
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization / frame encoding failure
    #[error("encode error: {0}")]
    Encode(String),

    /// IO error during listen/accept
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for Riptide operations
pub type Result<T> = std::result::Result<T, RiptideError>;

impl From<serde_json::Error> for RiptideError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

impl RiptideError {
    /// Create a not-found error naming the missing thing
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an already-exists error naming the duplicate
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Create a transport error with a message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Deadline expiry is recoverable: read pumps re-arm and continue
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Errors that terminate a connection when observed by a pump.
    ///
    /// Timeouts and full queues are not fatal; a closed or broken socket is.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Closed | Self::QueueClosed | Self::Transport(_) => true,
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recoverable() {
        let err = RiptideError::Timeout(Duration::from_secs(30));
        assert!(err.is_timeout());
        assert!(!err.is_fatal());
    }

    #[test]
    fn closed_and_transport_are_fatal() {
        assert!(RiptideError::Closed.is_fatal());
        assert!(RiptideError::transport("connection reset").is_fatal());
        assert!(!RiptideError::QueueFull.is_fatal());
    }

    #[test]
    fn io_classification() {
        let hard = RiptideError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(hard.is_fatal());

        let soft = RiptideError::Io(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(!soft.is_fatal());
    }

    #[test]
    fn encode_from_serde() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: RiptideError = parse_err.into();
        assert!(matches!(err, RiptideError::Encode(_)));
    }
}
