//! Bench control surface
//!
//! [`BenchController`] owns the cache, both pollers and the CSV recorder and
//! exposes every inbound operation. Construct it once and share it by `Arc`.
//!
//! Output and current-setpoint commands pass through a safety interlock: while
//! the cached CDS voltage is below [`SAFETY_MIN_VOLTAGE`] the output is forced
//! OFF and the setpoint to 0 A, whatever was requested.

use std::sync::Arc;
use std::time::Duration;

use bench_protocols::DeviceEndpoint;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheSnapshot, LastValueCache, SinkPowerReading};
use crate::commands::{
    compute_current_for_power, current_setpoint_command, CommandExecutor, GroupMode,
};
use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use crate::poller::{CdsPoller, CdsSnapshot, CycleOutcome, PollerStatus, SinkPowerPoller};
use crate::recorder::{CsvRecorder, RecorderState, RecordingStatus};

/// Minimum CDS voltage (V) for the output to be enabled or a current drawn
pub const SAFETY_MIN_VOLTAGE: f64 = 200.0;

fn interlock_engaged(voltage: f64) -> bool {
    voltage.is_nan() || voltage < SAFETY_MIN_VOLTAGE
}

/// Output command as actually sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutputCommand {
    pub requested_on: bool,
    pub applied_on: bool,
    pub interlocked: bool,
}

/// Current setpoint as actually sent
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SetpointCommand {
    pub requested: f64,
    pub applied: f64,
    pub interlocked: bool,
}

pub struct BenchController {
    config: BenchConfig,
    cache: Arc<LastValueCache>,
    recorder: Arc<CsvRecorder>,
    executor: CommandExecutor,
    cds_poller: CdsPoller,
    sink_poller: SinkPowerPoller,
}

impl BenchController {
    pub fn new(config: BenchConfig) -> Self {
        let cache = Arc::new(LastValueCache::new());
        let recorder = Arc::new(CsvRecorder::new(config.recording.output_dir.clone()));
        let executor = CommandExecutor::new(config.scpi_options());
        let cds_poller = CdsPoller::new(
            Arc::clone(&cache),
            Arc::clone(&recorder),
            config.cds_options(),
        );
        let sink_poller = SinkPowerPoller::new(Arc::clone(&cache), config.scpi_options());

        Self {
            config,
            cache,
            recorder,
            executor,
            cds_poller,
            sink_poller,
        }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<LastValueCache> {
        &self.cache
    }

    fn scpi_endpoint(&self, host: &str) -> Result<DeviceEndpoint> {
        endpoint(host, self.config.devices.scpi_port)
    }

    fn cds_endpoint(&self, host: &str) -> Result<DeviceEndpoint> {
        endpoint(host, self.config.devices.cds_port)
    }

    // ---- SCPI commands --------------------------------------------------

    pub async fn set_voltage_priority_mode(
        &self,
        host: &str,
        voltage_limit: f64,
        current_limit: f64,
    ) -> Result<()> {
        let endpoint = self.scpi_endpoint(host)?;
        self.executor
            .set_voltage_priority_mode(&endpoint, voltage_limit, current_limit)
            .await
    }

    pub async fn set_current_priority_mode(
        &self,
        host: &str,
        current_limit: f64,
        voltage_limit: f64,
    ) -> Result<()> {
        let endpoint = self.scpi_endpoint(host)?;
        self.executor
            .set_current_priority_mode(&endpoint, current_limit, voltage_limit)
            .await
    }

    /// Switch the output; forced OFF while the interlock is engaged
    pub async fn set_output(&self, host: &str, on: bool) -> Result<OutputCommand> {
        let endpoint = self.scpi_endpoint(host)?;
        let voltage = self.cache.voltage();
        let interlocked = on && interlock_engaged(voltage);
        if interlocked {
            warn!(
                "Interlock: output forced OFF, CDS voltage {} V < {} V",
                voltage, SAFETY_MIN_VOLTAGE
            );
        }

        let applied_on = on && !interlocked;
        self.executor.set_output(&endpoint, applied_on).await?;
        Ok(OutputCommand {
            requested_on: on,
            applied_on,
            interlocked,
        })
    }

    /// Set the current; forced to 0 A while the interlock is engaged.
    /// Negative or non-finite requests are rejected whatever the voltage.
    pub async fn set_current_setpoint(&self, host: &str, amps: f64) -> Result<SetpointCommand> {
        let endpoint = self.scpi_endpoint(host)?;
        current_setpoint_command(amps)?;
        let voltage = self.cache.voltage();
        let interlocked = amps != 0.0 && interlock_engaged(voltage);
        if interlocked {
            warn!(
                "Interlock: setpoint forced to 0 A, CDS voltage {} V < {} V",
                voltage, SAFETY_MIN_VOLTAGE
            );
        }

        let applied = if interlocked { 0.0 } else { amps };
        self.executor.set_current_setpoint(&endpoint, applied).await?;
        Ok(SetpointCommand {
            requested: amps,
            applied,
            interlocked,
        })
    }

    /// One `MEAS:POW?` on the current sink; the cache is not touched
    pub async fn get_sink_power_value(&self, host: &str) -> Result<SinkPowerReading> {
        let endpoint = self.scpi_endpoint(host)?;
        self.executor.read_sink_power(&endpoint).await
    }

    /// Sink current for a target power, see [`compute_current_for_power`]
    pub fn define_voltage_current(&self, power_kw: f64, voltage: f64) -> Result<f64> {
        compute_current_for_power(power_kw, voltage)
    }

    pub async fn set_group_mode(&self, host: &str, mode: GroupMode) -> Result<()> {
        let endpoint = self.scpi_endpoint(host)?;
        self.executor.set_group_mode(&endpoint, mode).await
    }

    // ---- CDS polling ----------------------------------------------------

    pub async fn start_polling_cds(&self, ip: &str, interval_ms: u64) -> Result<bool> {
        let endpoint = self.cds_endpoint(ip)?;
        self.cds_poller
            .start(&endpoint, Duration::from_millis(interval_ms))
            .await
    }

    pub async fn stop_polling_cds(&self) -> bool {
        self.cds_poller.stop().await
    }

    /// One CDS cycle outside a session, to fill the cache for the interlock
    pub async fn prime_cds(&self, ip: &str) -> Result<CycleOutcome> {
        let endpoint = self.cds_endpoint(ip)?;
        self.cds_poller.poll_once(&endpoint).await
    }

    pub async fn read_cds_snapshot(&self, ip: &str) -> Result<CdsSnapshot> {
        let endpoint = self.cds_endpoint(ip)?;
        self.cds_poller.read_snapshot(&endpoint).await
    }

    pub async fn cds_status(&self) -> PollerStatus {
        self.cds_poller.status().await
    }

    pub fn last_power_cds(&self) -> f64 {
        self.cache.power()
    }

    pub fn last_voltage_cds(&self) -> f64 {
        self.cache.voltage()
    }

    pub fn last_current_cds(&self) -> f64 {
        self.cache.current()
    }

    // ---- Sink polling ---------------------------------------------------

    pub async fn start_sink_power_polling(
        &self,
        ip: &str,
        interval_ms: u64,
        timeout_ms: u64,
    ) -> Result<bool> {
        let endpoint = self.scpi_endpoint(ip)?;
        self.sink_poller
            .start(
                &endpoint,
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
            )
            .await
    }

    pub async fn stop_sink_power_polling(&self) -> bool {
        self.sink_poller.stop().await
    }

    pub async fn sink_status(&self) -> PollerStatus {
        self.sink_poller.status().await
    }

    pub fn last_sink_power_value(&self) -> Option<SinkPowerReading> {
        self.cache.sink_power()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        self.cache.snapshot()
    }

    // ---- CSV recording --------------------------------------------------

    pub fn start_csv_logging(&self) -> RecordingStatus {
        self.recorder.start()
    }

    pub fn stop_csv_logging(&self) -> RecordingStatus {
        self.recorder.stop()
    }

    pub fn csv_logging_status(&self) -> RecorderState {
        self.recorder.status()
    }

    /// Stop both pollers, then the recording
    pub async fn shutdown(&self) {
        self.cds_poller.stop().await;
        self.sink_poller.stop().await;
        if self.recorder.is_enabled() {
            self.recorder.stop();
        }
        info!("Bench controller shut down");
    }
}

fn endpoint(host: &str, port: u16) -> Result<DeviceEndpoint> {
    let host = host.trim();
    if host.is_empty() {
        return Err(BenchError::invalid_parameter("device host is empty"));
    }
    Ok(DeviceEndpoint::new(host, port))
}
