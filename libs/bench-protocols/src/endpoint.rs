//! Device addressing

use std::fmt;

/// Default SCPI-over-TCP port (voltage source and current sink)
pub const SCPI_PORT: u16 = 5025;

/// Default CDS register protocol port
pub const CDS_PORT: u16 = 51001;

/// TCP address of one bench device. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceEndpoint {
    host: String,
    port: u16,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// SCPI device on the standard port
    pub fn scpi(host: impl Into<String>) -> Self {
        Self::new(host, SCPI_PORT)
    }

    /// CDS unit on the standard port
    pub fn cds(host: impl Into<String>) -> Self {
        Self::new(host, CDS_PORT)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` string accepted by `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
