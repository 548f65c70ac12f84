//! Bench device protocols
//!
//! Clients for the instruments on the AC charging test bench:
//!
//! - [`scpi`]: SCPI over TCP (voltage source, current sink)
//! - [`cds`]: binary register protocol of the charging-data-system unit
//!
//! With the `simulator` feature, [`simulator`] provides in-process TCP stand-ins
//! for both device kinds.

pub mod cds;
pub mod endpoint;
pub mod error;
pub mod scpi;

#[cfg(any(test, feature = "simulator"))]
pub mod simulator;

pub use cds::{registers, CdsAdapter, CdsOptions, CpState, RegisterAddress, RegisterFrame};
pub use endpoint::{DeviceEndpoint, CDS_PORT, SCPI_PORT};
pub use error::{ProtocolError, Result};
pub use scpi::{ResponsePolicy, ScpiClient, ScpiOptions, ScpiReply, NO_DATA_RECEIVED};
