//! CSV recording of polled values
//!
//! One file per recording session, one row per completed CDS poll cycle.
//! Row write failures are logged and swallowed so they never stop polling.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::CacheSnapshot;

pub const CSV_HEADER: [&str; 6] = [
    "Timestamp",
    "CDS_Power_W",
    "CDS_Voltage_V",
    "CDS_Current_A",
    "Sink_Power_W",
    "Sink_Success",
];

/// Result of a start/stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingStatus {
    pub success: bool,
    pub file_path: Option<PathBuf>,
}

/// Current recorder state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderState {
    pub enabled: bool,
    /// Active file, or the last one after a stop
    pub file_path: Option<PathBuf>,
    pub file_exists: bool,
}

#[derive(Default)]
struct RecorderInner {
    writer: Option<csv::Writer<File>>,
    file_path: Option<PathBuf>,
}

pub struct CsvRecorder {
    output_dir: PathBuf,
    inner: Mutex<RecorderInner>,
}

impl std::fmt::Debug for CsvRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvRecorder")
            .field("output_dir", &self.output_dir)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// `measwerte_<YYYY-MM-DDTHH-MM-SS-mmm>.csv`, local time
pub fn recording_file_name() -> String {
    Local::now()
        .format("measwerte_%Y-%m-%dT%H-%M-%S-%3f.csv")
        .to_string()
}

impl CsvRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            inner: Mutex::new(RecorderInner::default()),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().writer.is_some()
    }

    /// Open a new file and write the header. Refused while already recording.
    pub fn start(&self) -> RecordingStatus {
        let mut inner = self.inner.lock();
        if inner.writer.is_some() {
            warn!("CSV recording already active: {:?}", inner.file_path);
            return RecordingStatus {
                success: false,
                file_path: inner.file_path.clone(),
            };
        }

        let path = self.output_dir.join(recording_file_name());
        match create_recording(&self.output_dir, &path) {
            Ok(writer) => {
                info!("CSV recording started: {}", path.display());
                inner.writer = Some(writer);
                inner.file_path = Some(path.clone());
                RecordingStatus {
                    success: true,
                    file_path: Some(path),
                }
            },
            Err(e) => {
                error!("CSV create {}: {}", path.display(), e);
                RecordingStatus {
                    success: false,
                    file_path: None,
                }
            },
        }
    }

    /// Stop writing and flush. `success` is false when nothing was recording.
    pub fn stop(&self) -> RecordingStatus {
        let mut inner = self.inner.lock();
        match inner.writer.take() {
            Some(mut writer) => {
                if let Err(e) = writer.flush() {
                    warn!("CSV flush on stop: {}", e);
                }
                info!("CSV recording stopped: {:?}", inner.file_path);
                RecordingStatus {
                    success: true,
                    file_path: inner.file_path.clone(),
                }
            },
            None => RecordingStatus {
                success: false,
                file_path: inner.file_path.clone(),
            },
        }
    }

    pub fn status(&self) -> RecorderState {
        let inner = self.inner.lock();
        RecorderState {
            enabled: inner.writer.is_some(),
            file_path: inner.file_path.clone(),
            file_exists: inner.file_path.as_deref().is_some_and(Path::exists),
        }
    }

    /// Append one row when recording; no-op otherwise.
    ///
    /// Blocking write and flush under the recorder lock. Called from the CDS
    /// session task once per cycle.
    pub fn append_row(&self, snapshot: &CacheSnapshot) {
        let mut inner = self.inner.lock();
        let Some(writer) = inner.writer.as_mut() else {
            return;
        };

        let (sink_watts, sink_success) = match &snapshot.sink_power {
            Some(reading) => (
                reading.watts.map(|w| w.to_string()).unwrap_or_default(),
                reading.succeeded.to_string(),
            ),
            None => (String::new(), String::new()),
        };

        let record = [
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            snapshot.power.to_string(),
            snapshot.voltage.to_string(),
            snapshot.current.to_string(),
            sink_watts,
            sink_success,
        ];

        if let Err(e) = writer.write_record(&record) {
            warn!("CSV write: {}", e);
            return;
        }
        if let Err(e) = writer.flush() {
            warn!("CSV flush: {}", e);
        }
    }
}

fn create_recording(dir: &Path, path: &Path) -> crate::error::Result<csv::Writer<File>> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut writer = csv::Writer::from_writer(file);
    writer.write_record(CSV_HEADER)?;
    writer.flush()?;
    Ok(writer)
}
