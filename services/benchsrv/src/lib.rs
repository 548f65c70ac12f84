//! AC charging test bench service
//!
//! Device communication and polling for the bench: SCPI commands to the
//! voltage source and current sink, CDS telemetry polling into a last-value
//! cache, CSV recording and the [`BenchController`] control surface.

pub mod cache;
pub mod commands;
pub mod config;
pub mod control;
pub mod error;
pub mod poller;
pub mod recorder;

pub use cache::{CacheSnapshot, LastValueCache, SinkPowerReading};
pub use commands::{compute_current_for_power, CommandExecutor, GroupMode};
pub use config::BenchConfig;
pub use control::{BenchController, OutputCommand, SetpointCommand, SAFETY_MIN_VOLTAGE};
pub use error::{BenchError, Result};
pub use poller::{CdsPoller, CdsSnapshot, CycleOutcome, PollerStatus, SinkPowerPoller};
pub use recorder::{CsvRecorder, RecorderState, RecordingStatus};
