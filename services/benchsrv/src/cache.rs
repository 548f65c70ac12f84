//! Last-known-value cache
//!
//! One writer per field (the owning poller), any number of readers. Each field
//! is individually atomic; a [`CacheSnapshot`] is a best-effort, per-field read
//! and not a consistent cut across fields.

use std::sync::atomic::{AtomicU64, Ordering};

use bench_protocols::ScpiReply;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// `f64` stored as its bit pattern
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// Latest `MEAS:POW?` outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkPowerReading {
    pub succeeded: bool,
    /// Raw device payload, or "no data received"
    pub message: String,
    /// Payload as watts, when it parses as a number
    pub watts: Option<f64>,
    pub read_at: DateTime<Utc>,
}

impl SinkPowerReading {
    pub fn from_reply(reply: ScpiReply) -> Self {
        let watts = reply
            .payload
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite());
        Self {
            succeeded: reply.succeeded,
            message: reply.payload,
            watts,
            read_at: Utc::now(),
        }
    }
}

/// Point-in-time copy of all cached values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSnapshot {
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub sink_power: Option<SinkPowerReading>,
}

/// Process-lifetime cache of the most recent device values, zero-initialised
#[derive(Debug, Default)]
pub struct LastValueCache {
    power: AtomicF64,
    voltage: AtomicF64,
    current: AtomicF64,
    sink_power: RwLock<Option<SinkPowerReading>>,
}

impl LastValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// CDS real power, W
    pub fn power(&self) -> f64 {
        self.power.load()
    }

    /// CDS voltage L1, V
    pub fn voltage(&self) -> f64 {
        self.voltage.load()
    }

    /// CDS current L1, A
    pub fn current(&self) -> f64 {
        self.current.load()
    }

    pub fn sink_power(&self) -> Option<SinkPowerReading> {
        self.sink_power.read().clone()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            power: self.power(),
            voltage: self.voltage(),
            current: self.current(),
            sink_power: self.sink_power(),
        }
    }

    pub(crate) fn set_power(&self, watts: f64) {
        self.power.store(watts);
    }

    pub(crate) fn set_voltage(&self, volts: f64) {
        self.voltage.store(volts);
    }

    pub(crate) fn set_current(&self, amps: f64) {
        self.current.store(amps);
    }

    pub(crate) fn set_sink_power(&self, reading: SinkPowerReading) {
        *self.sink_power.write() = Some(reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_zero_initialised() {
        let cache = LastValueCache::new();
        assert_eq!(cache.power(), 0.0);
        assert_eq!(cache.voltage(), 0.0);
        assert_eq!(cache.current(), 0.0);
        assert!(cache.sink_power().is_none());
    }

    #[test]
    fn test_fields_are_independent() {
        let cache = LastValueCache::new();
        cache.set_voltage(400.0);
        cache.set_power(5000.0);
        cache.set_current(12.0);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.voltage, 400.0);
        assert_eq!(snapshot.power, 5000.0);
        assert_eq!(snapshot.current, 12.0);

        cache.set_voltage(-0.5);
        assert_eq!(cache.voltage(), -0.5);
        assert_eq!(cache.power(), 5000.0);
    }

    #[test]
    fn test_sink_reading_parses_watts() {
        let reading = SinkPowerReading::from_reply(ScpiReply {
            succeeded: true,
            payload: "4.998E+03".to_string(),
        });
        assert_eq!(reading.watts, Some(4998.0));

        let silent = SinkPowerReading::from_reply(ScpiReply {
            succeeded: true,
            payload: bench_protocols::NO_DATA_RECEIVED.to_string(),
        });
        assert!(silent.succeeded);
        assert_eq!(silent.watts, None);
        assert_eq!(silent.message, "no data received");
    }

    #[test]
    fn test_concurrent_readers() {
        let cache = Arc::new(LastValueCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    cache.set_voltage(i as f64);
                }
            })
        };
        let reader = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let v = cache.voltage();
                    assert!((0.0..1000.0).contains(&v));
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(cache.voltage(), 999.0);
    }
}
