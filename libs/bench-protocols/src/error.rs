//! Protocol error types
//!
//! Core error types for the SCPI and CDS clients.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol client errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Connection could not be established (refused, unreachable, DNS, connect timeout)
    #[error("Connection failed: {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// Socket-level failure on an established connection
    #[error("IO error: {0}")]
    Io(String),

    /// No (complete) response within the allotted time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or rejected frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation on a connection that was already closed
    #[error("Not connected")]
    NotConnected,
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

impl ProtocolError {
    pub fn connection(endpoint: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        ProtocolError::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ProtocolError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ProtocolError::Timeout(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        ProtocolError::Decode(msg.into())
    }

    /// Connection-level failure: the device could not be reached at all
    pub fn is_connection(&self) -> bool {
        matches!(self, ProtocolError::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout(_))
    }

    /// Frame-level failure; the transport itself is still usable
    pub fn is_decode(&self) -> bool {
        matches!(self, ProtocolError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: ProtocolError = io.into();
        assert!(matches!(err, ProtocolError::Io(ref msg) if msg.contains("reset by peer")));
        assert!(!err.is_connection());
    }

    #[test]
    fn test_classification() {
        assert!(ProtocolError::connection("10.0.0.1:5025", "refused").is_connection());
        assert!(ProtocolError::timeout("read").is_timeout());
        assert!(ProtocolError::decode("tag").is_decode());
        assert_eq!(
            ProtocolError::connection("10.0.0.1:5025", "refused").to_string(),
            "Connection failed: 10.0.0.1:5025: refused"
        );
    }
}
