//! Periodic device polling
//!
//! [`CdsPoller`] keeps one persistent CDS connection per session and chains
//! cycles: the next cycle starts `interval` after the previous one finished,
//! so cycles never overlap. [`SinkPowerPoller`] issues `MEAS:POW?` at a fixed
//! rate, one SCPI connection per read.
//!
//! Both are Idle or Active. `start` while Active and `stop` while Idle are
//! no-ops; start/stop are serialised per poller, so a start waits for a
//! pending teardown to finish. After `stop` returns the session no longer
//! writes to the cache.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bench_protocols::{
    registers, CdsAdapter, CdsOptions, CpState, DeviceEndpoint, ProtocolError, RegisterAddress,
    ScpiOptions,
};
use serde::{Serialize, Serializer};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::LastValueCache;
use crate::commands::CommandExecutor;
use crate::error::{BenchError, Result};
use crate::recorder::CsvRecorder;

/// Observable poller state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerStatus {
    pub active: bool,
    pub endpoint: Option<String>,
    pub interval_ms: Option<u64>,
    /// Cycles run in the current (or last) session
    pub cycles: u64,
    /// Cycles that aborted or hit a decode error
    pub failures: u64,
}

#[derive(Debug, Default)]
struct PollStats {
    cycles: AtomicU64,
    failures: AtomicU64,
}

impl PollStats {
    fn reset(&self) {
        self.cycles.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    fn record(&self, ok: bool) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn status(&self, session: Option<(&DeviceEndpoint, Duration)>) -> PollerStatus {
        PollerStatus {
            active: session.is_some(),
            endpoint: session.map(|(endpoint, _)| endpoint.to_string()),
            interval_ms: session.map(|(_, interval)| interval.as_millis() as u64),
            cycles: self.cycles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

fn check_interval(name: &str, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(BenchError::invalid_parameter(format!(
            "{} must be greater than zero",
            name
        )));
    }
    Ok(())
}

// ============================================================================
// CDS
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Field {
    Voltage,
    Power,
    Current,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Voltage => "voltage",
            Field::Power => "power",
            Field::Current => "current",
        })
    }
}

const CYCLE_FIELDS: [(Field, RegisterAddress); 3] = [
    (Field::Voltage, registers::VOLTAGE_L1),
    (Field::Power, registers::REAL_POWER),
    (Field::Current, registers::CURRENT_L1),
];

/// How a single poll cycle ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// All fields read; `decode_errors` of them were skipped
    Completed { decode_errors: usize },
    /// Transport failure; the remaining fields were not read
    Aborted(ProtocolError),
    /// Session stopped mid-cycle; late results discarded
    Cancelled,
}

/// Read voltage, power and current in order and write them to the cache.
///
/// Decode errors skip the field. Timeouts and I/O errors end the cycle.
/// Nothing is written once `token` is cancelled, including a value whose
/// read was already in flight.
async fn poll_cycle(
    adapter: &mut CdsAdapter,
    token: &CancellationToken,
    cache: &LastValueCache,
) -> CycleOutcome {
    let mut decode_errors = 0;

    for (field, address) in CYCLE_FIELDS {
        if token.is_cancelled() {
            return CycleOutcome::Cancelled;
        }

        match adapter.read_f32(address).await {
            Ok(value) => {
                if token.is_cancelled() {
                    debug!("CDS {} discarded after stop", field);
                    return CycleOutcome::Cancelled;
                }
                let value = f64::from(value);
                match field {
                    Field::Voltage => cache.set_voltage(value),
                    Field::Power if value > 0.0 => cache.set_power(value),
                    Field::Power => debug!("CDS power {} W discarded", value),
                    Field::Current => cache.set_current(value),
                }
            },
            Err(e) if e.is_decode() => {
                warn!("CDS {}: {}", field, e);
                decode_errors += 1;
            },
            Err(e) => {
                warn!("CDS cycle aborted at {}: {}", field, e);
                return CycleOutcome::Aborted(e);
            },
        }
    }

    CycleOutcome::Completed { decode_errors }
}

async fn run_cds_session(
    mut adapter: CdsAdapter,
    interval: Duration,
    token: CancellationToken,
    cache: Arc<LastValueCache>,
    recorder: Arc<CsvRecorder>,
    stats: Arc<PollStats>,
) -> CdsAdapter {
    loop {
        let outcome = poll_cycle(&mut adapter, &token, &cache).await;
        match outcome {
            // A cycle finishing as the session stops counts as cancelled
            CycleOutcome::Completed { .. } if token.is_cancelled() => break,
            CycleOutcome::Completed { decode_errors } => {
                stats.record(decode_errors == 0);
                recorder.append_row(&cache.snapshot());
            },
            CycleOutcome::Aborted(_) => stats.record(false),
            CycleOutcome::Cancelled => break,
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {},
        }
    }

    debug!("CDS polling task exit: {}", adapter.endpoint());
    adapter
}

struct CdsSession {
    endpoint: DeviceEndpoint,
    interval: Duration,
    token: CancellationToken,
    handle: JoinHandle<CdsAdapter>,
}

/// Values of all known CDS registers, read once
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CdsSnapshot {
    pub ev_max_current: Option<f64>,
    pub ev_charging_current: Option<f64>,
    pub evse_max_current: Option<f64>,
    pub ev_duty_cycle: Option<f64>,
    pub pp_max_current: Option<f64>,
    pub real_power: Option<f64>,
    pub voltage_l1: Option<f64>,
    pub current_l1: Option<f64>,
    #[serde(serialize_with = "serialize_cp_state")]
    pub cp_state: Option<CpState>,
}

fn serialize_cp_state<S: Serializer>(
    state: &Option<CpState>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match state {
        Some(state) => serializer.serialize_str(state.as_str()),
        None => serializer.serialize_none(),
    }
}

/// `None` for a rejected register, error for a transport failure
async fn optional_f32(adapter: &mut CdsAdapter, address: RegisterAddress) -> Result<Option<f64>> {
    match adapter.read_f32(address).await {
        Ok(value) => Ok(Some(f64::from(value))),
        Err(e) if e.is_decode() => {
            debug!("CDS snapshot {}: {}", address, e);
            Ok(None)
        },
        Err(e) => Err(e.into()),
    }
}

async fn read_all_registers(adapter: &mut CdsAdapter) -> Result<CdsSnapshot> {
    let cp_state = match adapter.read_cp_state().await {
        Ok(state) => Some(state),
        Err(e) if e.is_decode() => None,
        Err(e) => return Err(e.into()),
    };

    Ok(CdsSnapshot {
        ev_max_current: optional_f32(adapter, registers::EV_MAX_CURRENT).await?,
        ev_charging_current: optional_f32(adapter, registers::EV_CHARGING_CURRENT).await?,
        evse_max_current: optional_f32(adapter, registers::EVSE_MAX_CURRENT).await?,
        ev_duty_cycle: optional_f32(adapter, registers::EV_DUTY_CYCLE).await?,
        pp_max_current: optional_f32(adapter, registers::PP_MAX_CURRENT).await?,
        real_power: optional_f32(adapter, registers::REAL_POWER).await?,
        voltage_l1: optional_f32(adapter, registers::VOLTAGE_L1).await?,
        current_l1: optional_f32(adapter, registers::CURRENT_L1).await?,
        cp_state,
    })
}

/// CDS telemetry poller
pub struct CdsPoller {
    cache: Arc<LastValueCache>,
    recorder: Arc<CsvRecorder>,
    options: CdsOptions,
    session: Mutex<Option<CdsSession>>,
    stats: Arc<PollStats>,
}

impl CdsPoller {
    pub fn new(cache: Arc<LastValueCache>, recorder: Arc<CsvRecorder>, options: CdsOptions) -> Self {
        Self {
            cache,
            recorder,
            options,
            session: Mutex::new(None),
            stats: Arc::new(PollStats::default()),
        }
    }

    /// Open the adapter, begin the stream and spawn the cycle task.
    ///
    /// `Ok(false)` when a session is already active. Connection or
    /// begin-stream failures are returned and leave the poller Idle with no
    /// socket open.
    pub async fn start(&self, endpoint: &DeviceEndpoint, interval: Duration) -> Result<bool> {
        check_interval("CDS polling interval", interval)?;

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            debug!("CDS polling already active: {}", active.endpoint);
            return Ok(false);
        }

        let adapter = self.open_streaming(endpoint).await?;

        self.stats.reset();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_cds_session(
            adapter,
            interval,
            token.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.recorder),
            Arc::clone(&self.stats),
        ));

        *session = Some(CdsSession {
            endpoint: endpoint.clone(),
            interval,
            token,
            handle,
        });

        info!(
            "CDS polling started: {} every {} ms",
            endpoint,
            interval.as_millis()
        );
        Ok(true)
    }

    /// Stop the session and tear the connection down.
    ///
    /// The in-flight read (if any) is allowed to finish and its value is
    /// discarded. Returns false when there was nothing to stop.
    pub async fn stop(&self) -> bool {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            debug!("CDS polling not active");
            return false;
        };

        active.token.cancel();
        match active.handle.await {
            Ok(adapter) => teardown(adapter).await,
            Err(e) => error!("CDS polling task failed: {}", e),
        }

        info!("CDS polling stopped: {}", active.endpoint);
        true
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn status(&self) -> PollerStatus {
        let session = self.session.lock().await;
        self.stats.status(
            session
                .as_ref()
                .map(|active| (&active.endpoint, active.interval)),
        )
    }

    /// One cycle on a temporary connection, without recording.
    ///
    /// Used to fill the cache before a one-shot command when no session is
    /// running. [`BenchError::ResourceBusy`] while a session is active.
    pub async fn poll_once(&self, endpoint: &DeviceEndpoint) -> Result<CycleOutcome> {
        let _session = self.idle_session().await?;

        let mut adapter = self.open_streaming(endpoint).await?;
        let outcome = poll_cycle(&mut adapter, &CancellationToken::new(), &self.cache).await;
        teardown(adapter).await;

        match outcome {
            CycleOutcome::Aborted(e) => Err(e.into()),
            other => Ok(other),
        }
    }

    /// Read every known register once on a temporary connection.
    /// [`BenchError::ResourceBusy`] while a session is active.
    pub async fn read_snapshot(&self, endpoint: &DeviceEndpoint) -> Result<CdsSnapshot> {
        let _session = self.idle_session().await?;

        let mut adapter = self.open_streaming(endpoint).await?;
        let snapshot = read_all_registers(&mut adapter).await;
        teardown(adapter).await;
        snapshot
    }

    /// Session lock, held by one-shot reads so no session can start meanwhile
    async fn idle_session(&self) -> Result<MutexGuard<'_, Option<CdsSession>>> {
        let session = self.session.lock().await;
        if session.is_some() {
            return Err(BenchError::busy("CDS polling is active"));
        }
        Ok(session)
    }

    /// Connect and begin the stream; the socket is closed again if either fails
    async fn open_streaming(&self, endpoint: &DeviceEndpoint) -> Result<CdsAdapter> {
        let mut adapter = CdsAdapter::open(endpoint, self.options.clone()).await?;
        if let Err(e) = adapter.begin_stream().await {
            warn!("CDS begin stream {}: {}", endpoint, e);
            if let Err(close_err) = adapter.close().await {
                debug!("CDS close {}: {}", endpoint, close_err);
            }
            return Err(e.into());
        }
        Ok(adapter)
    }
}

/// End the stream and close, each step guarded on its own
async fn teardown(mut adapter: CdsAdapter) {
    let endpoint = adapter.endpoint().clone();
    if let Err(e) = adapter.end_stream().await {
        warn!("CDS end stream {}: {}", endpoint, e);
    }
    if let Err(e) = adapter.close().await {
        warn!("CDS close {}: {}", endpoint, e);
    }
}

impl Drop for CdsPoller {
    fn drop(&mut self) {
        // The task drops its adapter (and socket) once cancelled
        if let Some(active) = self.session.get_mut().take() {
            active.token.cancel();
        }
    }
}

// ============================================================================
// Sink power
// ============================================================================

struct SinkSession {
    endpoint: DeviceEndpoint,
    interval: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

async fn run_sink_session(
    executor: CommandExecutor,
    endpoint: DeviceEndpoint,
    interval: Duration,
    token: CancellationToken,
    cache: Arc<LastValueCache>,
    stats: Arc<PollStats>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {},
        }

        // A pending read is dropped on stop; its connection closes with it
        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = executor.read_sink_power(&endpoint) => result,
        };

        match result {
            Ok(reading) => {
                stats.record(true);
                if !token.is_cancelled() {
                    cache.set_sink_power(reading);
                }
            },
            Err(e) => {
                stats.record(false);
                warn!("Sink power read {}: {}", endpoint, e);
            },
        }
    }

    debug!("Sink polling task exit: {}", endpoint);
}

/// Current sink power poller
pub struct SinkPowerPoller {
    cache: Arc<LastValueCache>,
    options: ScpiOptions,
    session: Mutex<Option<SinkSession>>,
    stats: Arc<PollStats>,
}

impl SinkPowerPoller {
    /// `options` supplies the connect timeout; the response timeout is given per session
    pub fn new(cache: Arc<LastValueCache>, options: ScpiOptions) -> Self {
        Self {
            cache,
            options,
            session: Mutex::new(None),
            stats: Arc::new(PollStats::default()),
        }
    }

    /// Start fixed-rate polling. `Ok(false)` when already active.
    ///
    /// Failed reads are logged and keep the previous cached reading.
    pub async fn start(
        &self,
        endpoint: &DeviceEndpoint,
        interval: Duration,
        response_timeout: Duration,
    ) -> Result<bool> {
        check_interval("sink polling interval", interval)?;
        check_interval("sink response timeout", response_timeout)?;

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            debug!("Sink polling already active: {}", active.endpoint);
            return Ok(false);
        }

        let executor =
            CommandExecutor::new(self.options.clone().with_response_timeout(response_timeout));
        self.stats.reset();
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_sink_session(
            executor,
            endpoint.clone(),
            interval,
            token.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.stats),
        ));

        *session = Some(SinkSession {
            endpoint: endpoint.clone(),
            interval,
            token,
            handle,
        });

        info!(
            "Sink polling started: {} every {} ms",
            endpoint,
            interval.as_millis()
        );
        Ok(true)
    }

    pub async fn stop(&self) -> bool {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            debug!("Sink polling not active");
            return false;
        };

        active.token.cancel();
        if let Err(e) = active.handle.await {
            error!("Sink polling task failed: {}", e);
        }

        info!("Sink polling stopped: {}", active.endpoint);
        true
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn status(&self) -> PollerStatus {
        let session = self.session.lock().await;
        self.stats.status(
            session
                .as_ref()
                .map(|active| (&active.endpoint, active.interval)),
        )
    }
}

impl Drop for SinkPowerPoller {
    fn drop(&mut self) {
        if let Some(active) = self.session.get_mut().take() {
            active.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_protocols::simulator::{CdsReply, CdsSimulator};

    fn fast_cds() -> CdsOptions {
        CdsOptions {
            connect_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_cycle_reads_in_order_and_discards_non_positive_power() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_measurements(400.0, 5000.0, 12.0);
        let cache = LastValueCache::new();
        let token = CancellationToken::new();

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_cds()).await.unwrap();
        let outcome = poll_cycle(&mut adapter, &token, &cache).await;
        assert_eq!(outcome, CycleOutcome::Completed { decode_errors: 0 });
        assert_eq!(cache.power(), 5000.0);

        sim.set_measurements(401.0, 0.0, 0.0);
        poll_cycle(&mut adapter, &token, &cache).await;
        assert_eq!(cache.voltage(), 401.0);
        assert_eq!(cache.power(), 5000.0);
        assert_eq!(cache.current(), 0.0);
    }

    #[tokio::test]
    async fn test_decode_error_skips_only_that_field() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_measurements(230.0, 3000.0, 13.0);
        sim.set_reply(registers::REAL_POWER, CdsReply::Nak);
        let cache = LastValueCache::new();

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_cds()).await.unwrap();
        let outcome = poll_cycle(&mut adapter, &CancellationToken::new(), &cache).await;

        assert_eq!(outcome, CycleOutcome::Completed { decode_errors: 1 });
        assert_eq!(cache.voltage(), 230.0);
        assert_eq!(cache.power(), 0.0);
        assert_eq!(cache.current(), 13.0);
    }

    #[tokio::test]
    async fn test_timeout_aborts_cycle() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_measurements(230.0, 3000.0, 13.0);
        sim.set_reply(registers::REAL_POWER, CdsReply::Silent);
        let cache = LastValueCache::new();

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_cds()).await.unwrap();
        let outcome = poll_cycle(&mut adapter, &CancellationToken::new(), &cache).await;

        assert!(matches!(outcome, CycleOutcome::Aborted(ref e) if e.is_timeout()));
        assert_eq!(cache.voltage(), 230.0);
        // Current comes after power and was never read
        assert_eq!(cache.current(), 0.0);
    }

    #[tokio::test]
    async fn test_cancelled_token_writes_nothing() {
        let sim = CdsSimulator::start().await.unwrap();
        sim.set_measurements(230.0, 3000.0, 13.0);
        let cache = LastValueCache::new();
        let token = CancellationToken::new();
        token.cancel();

        let mut adapter = CdsAdapter::open(&sim.endpoint(), fast_cds()).await.unwrap();
        assert_eq!(
            poll_cycle(&mut adapter, &token, &cache).await,
            CycleOutcome::Cancelled
        );
        assert_eq!(cache.voltage(), 0.0);
        assert_eq!(sim.register_reads(), 0);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let cache = Arc::new(LastValueCache::new());
        let dir = tempfile::tempdir().unwrap();
        let poller = CdsPoller::new(
            Arc::clone(&cache),
            Arc::new(CsvRecorder::new(dir.path())),
            fast_cds(),
        );
        let sim = CdsSimulator::start().await.unwrap();
        let err = poller
            .start(&sim.endpoint(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::InvalidParameter(_)));
        assert_eq!(sim.accepted_connections(), 0);
    }

    #[test]
    fn test_snapshot_serializes_cp_state() {
        let snapshot = CdsSnapshot {
            ev_max_current: Some(32.0),
            ev_charging_current: None,
            evse_max_current: None,
            ev_duty_cycle: None,
            pp_max_current: None,
            real_power: None,
            voltage_l1: None,
            current_l1: None,
            cp_state: Some(CpState::C2),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["cp_state"], "C2");
        assert_eq!(json["ev_max_current"], 32.0);
        assert!(json["real_power"].is_null());
    }
}
