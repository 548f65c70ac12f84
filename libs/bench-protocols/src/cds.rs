//! CDS telemetry unit: binary register protocol over TCP

pub mod codec;
pub mod connection;

pub use codec::{decode_float, registers, CpState, RegisterAddress, RegisterFrame};
pub use connection::{CdsAdapter, CdsOptions};
