//! Basic library shared by the bench services
//!
//! Provides:
//! - logging bootstrap (console + daily rolling file, runtime level changes)
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use shutdown::{shutdown_token, wait_for_shutdown};
