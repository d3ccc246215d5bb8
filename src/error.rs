//! Error types for the push protocol.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PushError>;

#[derive(Debug, Error)]
pub enum PushError {
    /// The transport could not be opened.
    #[error("Failed to connect to {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// Any read or write failure once the link is up.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A second `send()` while one is already in flight on the same connection.
    #[error("A transfer is already in progress on this connection")]
    TransferBusy,

    #[error("Connection is closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for FILE_ACK")]
    AckTimeout(Duration),

    #[error("Transfer cancelled")]
    Cancelled,

    /// The FILE length field is a signed 32-bit integer.
    #[error("{} is {len} bytes, larger than the protocol's 2 GiB limit", path.display())]
    FileTooLarge { path: PathBuf, len: u64 },

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

impl PushError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True for errors raised by the link itself rather than by local input.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            PushError::Connect { .. } | PushError::Io(_) | PushError::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_display() {
        let err = PushError::UnknownMessageType(0x2a);
        assert_eq!(err.to_string(), "Unknown message type: 0x2a");
    }

    #[test]
    fn test_link_failure_classification() {
        let io = PushError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(io.is_link_failure());
        assert!(PushError::Closed.is_link_failure());
        assert!(!PushError::TransferBusy.is_link_failure());
        assert!(!PushError::InvalidName("x".into()).is_link_failure());
    }
}
