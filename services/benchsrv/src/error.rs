//! Error handling for the bench service

use std::path::PathBuf;

use bench_protocols::ProtocolError;
use thiserror::Error;

/// Bench service error type
#[derive(Error, Debug, Clone)]
pub enum BenchError {
    /// Configuration file absent or unreadable
    #[error("Configuration missing: {}", path.display())]
    ConfigurationMissing { path: PathBuf },

    /// A value an operation needs was not configured (e.g. a device IP)
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Device could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Malformed or rejected device frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation conflicts with an active session
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the bench service
pub type Result<T> = std::result::Result<T, BenchError>;

impl BenchError {
    pub fn missing_config(field: impl Into<String>) -> Self {
        BenchError::MissingConfig(field.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        BenchError::InvalidConfig(msg.into())
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        BenchError::InvalidParameter(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        BenchError::ResourceBusy(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        BenchError::Internal(msg.into())
    }

    /// Stable error code for logs and CLI exit reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            BenchError::ConfigurationMissing { .. } => "CONFIGURATION_MISSING",
            BenchError::MissingConfig(_) => "MISSING_CONFIG",
            BenchError::InvalidConfig(_) => "INVALID_CONFIG",
            BenchError::Connection(_) => "CONNECTION_ERROR",
            BenchError::Timeout(_) => "TIMEOUT",
            BenchError::Protocol(_) => "PROTOCOL_ERROR",
            BenchError::Io(_) => "IO_ERROR",
            BenchError::InvalidParameter(_) => "INVALID_PARAMETER",
            BenchError::ResourceBusy(_) => "RESOURCE_BUSY",
            BenchError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// The attempted device could not be reached (refused, unreachable, reset)
    pub fn is_device_unreachable(&self) -> bool {
        matches!(self, BenchError::Connection(_))
    }
}

impl From<ProtocolError> for BenchError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Connection { .. } | ProtocolError::NotConnected => {
                BenchError::Connection(err.to_string())
            },
            ProtocolError::Io(msg) => BenchError::Io(msg),
            ProtocolError::Timeout(msg) => BenchError::Timeout(msg),
            ProtocolError::Decode(msg) => BenchError::Protocol(msg),
        }
    }
}

impl From<std::io::Error> for BenchError {
    fn from(err: std::io::Error) -> Self {
        BenchError::Io(err.to_string())
    }
}

impl From<csv::Error> for BenchError {
    fn from(err: csv::Error) -> Self {
        BenchError::Io(format!("CSV: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_mapping() {
        let err: BenchError = ProtocolError::connection("10.0.0.5:5025", "refused").into();
        assert!(err.is_device_unreachable());
        assert_eq!(err.error_code(), "CONNECTION_ERROR");

        let err: BenchError = ProtocolError::timeout("read").into();
        assert!(matches!(err, BenchError::Timeout(_)));
        assert!(!err.is_device_unreachable());

        let err: BenchError = ProtocolError::decode("NAK").into();
        assert!(matches!(err, BenchError::Protocol(ref m) if m == "NAK"));
    }

    #[test]
    fn test_configuration_missing_display() {
        let err = BenchError::ConfigurationMissing {
            path: PathBuf::from("/etc/bench/benchsrv.toml"),
        };
        assert_eq!(
            err.to_string(),
            "Configuration missing: /etc/bench/benchsrv.toml"
        );
        assert_eq!(err.error_code(), "CONFIGURATION_MISSING");
    }
}
