//! Error type shared by every mpyboard crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Crate-wide result alias.
pub type ReplResult<T> = Result<T, ReplError>;

/// Error returned by connection, correlator and file operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplError {
    pub kind: ReplErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplErrorKind {
    /// Rejected before any transport interaction (missing URL, no port...).
    Validation,
    /// The status machine refused a transition.
    InvalidTransition,
    NotConnected,
    ConnectionRefused,
    /// Open / write / read failure on the underlying transport.
    Transport,
    /// The remote closed the stream.
    StreamClosed,
    AuthFailed,
    /// Sentinel or payload could not be interpreted.
    Protocol,
    /// The snippet ran and reported an `ERROR:` token.
    Remote,
    Timeout,
    QueueTimeout,
    QueueCleared,
    NotFound,
    Io,
    Config,
    Internal,
}

impl fmt::Display for ReplError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ReplError {}

impl ReplError {
    pub fn new(kind: ReplErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Validation, msg)
    }

    pub fn not_connected() -> Self {
        Self::new(ReplErrorKind::NotConnected, "Not connected")
    }

    /// A connect attempt overtaken by a disconnect or a newer connect.
    pub fn connect_cancelled() -> Self {
        Self::new(ReplErrorKind::NotConnected, "Connect cancelled")
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Transport, msg)
    }

    pub fn stream_closed(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::StreamClosed, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Protocol, msg)
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Remote, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Timeout, msg)
    }

    pub fn queue_cleared() -> Self {
        Self::new(ReplErrorKind::QueueCleared, "Command queue cleared")
    }

    pub fn queue_timeout() -> Self {
        Self::new(
            ReplErrorKind::QueueTimeout,
            "Command queue is busy, connection may be lost",
        )
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(ReplErrorKind::NotFound, format!("'{}' not found", what))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Config, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ReplErrorKind::Internal, msg)
    }

    pub fn is(&self, kind: ReplErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<std::io::Error> for ReplError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                Self::new(ReplErrorKind::ConnectionRefused, e.to_string())
            }
            std::io::ErrorKind::TimedOut => Self::new(ReplErrorKind::Timeout, e.to_string()),
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                Self::new(ReplErrorKind::StreamClosed, e.to_string())
            }
            _ => Self::new(ReplErrorKind::Io, e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ReplError {
    fn from(e: serde_json::Error) -> Self {
        Self::config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = ReplError::timeout("took too long");
        assert_eq!(err.to_string(), "Timeout: took too long");
    }

    #[test]
    fn io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        assert!(ReplError::from(refused).is(ReplErrorKind::ConnectionRefused));

        let pipe = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(ReplError::from(pipe).is(ReplErrorKind::StreamClosed));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "?");
        assert!(ReplError::from(other).is(ReplErrorKind::Io));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ReplError::queue_cleared()).unwrap();
        assert_eq!(json["kind"], "QueueCleared");
        assert_eq!(json["message"], "Command queue cleared");
    }
}
