//! Bench configuration
//!
//! Loaded with figment: built-in defaults, then the config file (TOML, YAML or
//! JSON by extension), then `BENCHSRV_` environment variables with `__` as the
//! section separator, e.g. `BENCHSRV_DEVICES__CDS=192.168.0.30`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bench_protocols::{CdsOptions, DeviceEndpoint, ScpiOptions, CDS_PORT, SCPI_PORT};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BenchError, Result};

/// Default config file name
pub const DEFAULT_CONFIG_FILE: &str = "benchsrv.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "BENCHSRV_";

/// Device addresses. IPs are never defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub voltage_source: Option<String>,
    pub current_sink: Option<String>,
    pub cds: Option<String>,
    pub scpi_port: u16,
    pub cds_port: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            voltage_source: None,
            current_sink: None,
            cds: None,
            scpi_port: SCPI_PORT,
            cds_port: CDS_PORT,
        }
    }
}

/// Limits used when a mode command is issued without explicit values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Volts
    pub voltage_limit: f64,
    /// Amps
    pub current_limit: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            voltage_limit: 400.0,
            current_limit: 32.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub scpi_connect_ms: u64,
    pub scpi_response_ms: u64,
    pub cds_connect_ms: u64,
    pub cds_read_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scpi_connect_ms: 3000,
            scpi_response_ms: 1000,
            cds_connect_ms: 3000,
            cds_read_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub cds_interval_ms: u64,
    pub sink_interval_ms: u64,
    pub sink_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            cds_interval_ms: 1000,
            sink_interval_ms: 1000,
            sink_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    /// JSON lines in the log file
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("logs"),
            json: false,
        }
    }
}

/// Complete bench configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub devices: DeviceConfig,
    pub limits: LimitsConfig,
    pub timeouts: TimeoutConfig,
    pub polling: PollingConfig,
    pub recording: RecordingConfig,
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Load from `path` plus environment overrides.
    ///
    /// A missing or unreadable file is [`BenchError::ConfigurationMissing`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            debug!("Config read {}: {}", path.display(), e);
            BenchError::ConfigurationMissing {
                path: path.to_path_buf(),
            }
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("toml")
            .to_lowercase();

        let figment = Figment::from(Serialized::defaults(BenchConfig::default()));
        let figment = match extension.as_str() {
            "toml" => figment.merge(Toml::string(&content)),
            "yaml" | "yml" => figment.merge(Yaml::string(&content)),
            "json" => figment.merge(Json::string(&content)),
            other => {
                return Err(BenchError::invalid_config(format!(
                    "unsupported config format '{}': {}",
                    other,
                    path.display()
                )))
            },
        };

        let config = Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))?;
        info!("Config loaded: {}", path.display());
        Ok(config)
    }

    /// Defaults plus environment overrides, no file
    pub fn from_env() -> Result<Self> {
        Self::extract(
            Figment::from(Serialized::defaults(BenchConfig::default()))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: BenchConfig = figment
            .extract()
            .map_err(|e| BenchError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("limits.voltage_limit", self.limits.voltage_limit),
            ("limits.current_limit", self.limits.current_limit),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(BenchError::invalid_config(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("timeouts.scpi_connect_ms", self.timeouts.scpi_connect_ms),
            ("timeouts.scpi_response_ms", self.timeouts.scpi_response_ms),
            ("timeouts.cds_connect_ms", self.timeouts.cds_connect_ms),
            ("timeouts.cds_read_ms", self.timeouts.cds_read_ms),
            ("polling.cds_interval_ms", self.polling.cds_interval_ms),
            ("polling.sink_interval_ms", self.polling.sink_interval_ms),
            ("polling.sink_timeout_ms", self.polling.sink_timeout_ms),
        ] {
            if value == 0 {
                return Err(BenchError::invalid_config(format!("{} must be > 0", name)));
            }
        }

        if self.devices.scpi_port == 0 || self.devices.cds_port == 0 {
            return Err(BenchError::invalid_config("device ports must be > 0"));
        }

        Ok(())
    }

    pub fn voltage_source(&self) -> Result<DeviceEndpoint> {
        required_host(&self.devices.voltage_source, "devices.voltage_source")
            .map(|host| DeviceEndpoint::new(host, self.devices.scpi_port))
    }

    pub fn current_sink(&self) -> Result<DeviceEndpoint> {
        required_host(&self.devices.current_sink, "devices.current_sink")
            .map(|host| DeviceEndpoint::new(host, self.devices.scpi_port))
    }

    pub fn cds(&self) -> Result<DeviceEndpoint> {
        required_host(&self.devices.cds, "devices.cds")
            .map(|host| DeviceEndpoint::new(host, self.devices.cds_port))
    }

    pub fn scpi_options(&self) -> ScpiOptions {
        ScpiOptions::default()
            .with_connect_timeout(Duration::from_millis(self.timeouts.scpi_connect_ms))
            .with_response_timeout(Duration::from_millis(self.timeouts.scpi_response_ms))
    }

    pub fn cds_options(&self) -> CdsOptions {
        CdsOptions {
            connect_timeout: Duration::from_millis(self.timeouts.cds_connect_ms),
            read_timeout: Duration::from_millis(self.timeouts.cds_read_ms),
        }
    }
}

fn required_host(value: &Option<String>, field: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(BenchError::missing_config(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!(config.devices.scpi_port, 5025);
        assert_eq!(config.devices.cds_port, 51001);
        assert_eq!(config.timeouts.scpi_response_ms, 1000);
        assert_eq!(config.timeouts.cds_read_ms, 2000);
        assert_eq!(config.polling.cds_interval_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_partial() {
        let (_dir, path) = write_config(
            "bench.toml",
            r#"
[devices]
voltage_source = "192.168.0.10"
cds = "192.168.0.30"

[polling]
cds_interval_ms = 250
"#,
        );

        let config = BenchConfig::load(&path).unwrap();
        assert_eq!(
            config.voltage_source().unwrap(),
            DeviceEndpoint::new("192.168.0.10", 5025)
        );
        assert_eq!(config.cds().unwrap().port(), 51001);
        assert_eq!(config.polling.cds_interval_ms, 250);
        assert_eq!(config.polling.sink_interval_ms, 1000);
    }

    #[test]
    fn test_load_yaml() {
        let (_dir, path) = write_config(
            "bench.yaml",
            "devices:\n  current_sink: 192.168.0.20\n  scpi_port: 6025\nlimits:\n  current_limit: 16\n",
        );

        let config = BenchConfig::load(&path).unwrap();
        assert_eq!(
            config.current_sink().unwrap(),
            DeviceEndpoint::new("192.168.0.20", 6025)
        );
        assert_eq!(config.limits.current_limit, 16.0);
    }

    #[test]
    fn test_missing_file_is_configuration_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = BenchConfig::load(&path).unwrap_err();
        assert!(matches!(err, BenchError::ConfigurationMissing { path: p } if p == path));
    }

    #[test]
    fn test_unconfigured_device_is_missing_config() {
        let config = BenchConfig::default();
        let err = config.current_sink().unwrap_err();
        assert!(matches!(err, BenchError::MissingConfig(ref f) if f == "devices.current_sink"));

        let mut config = BenchConfig::default();
        config.devices.cds = Some("   ".to_string());
        assert!(matches!(config.cds(), Err(BenchError::MissingConfig(_))));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let (_dir, path) = write_config("bench.toml", "[polling]\nsink_interval_ms = 0\n");
        let err = BenchConfig::load(&path).unwrap_err();
        assert!(matches!(err, BenchError::InvalidConfig(ref m) if m.contains("sink_interval_ms")));
    }

    #[test]
    fn test_unsupported_extension() {
        let (_dir, path) = write_config("bench.ini", "x=1");
        assert!(matches!(
            BenchConfig::load(&path),
            Err(BenchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_options_follow_timeouts() {
        let mut config = BenchConfig::default();
        config.timeouts.scpi_response_ms = 250;
        config.timeouts.cds_read_ms = 500;
        assert_eq!(
            config.scpi_options().response_timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.cds_options().read_timeout, Duration::from_millis(500));
    }
}
