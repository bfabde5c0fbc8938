//! Telemetry sources and the per-period [`TelemetryLog`].
//!
//! Mechanisms publish quantities by registering one supplier closure per
//! label on a [`TelemetrySink`].  The log samples every supplier, in
//! registration order, each time [`TelemetryLog::save_logs`] is called (once
//! per control period) and optionally appends the resulting
//! [`TelemetryFrame`] as a JSON line to a writer.  The writer is flushed on
//! [`TelemetryLog::flush`] and on drop, never per frame.
//!
//! # Example
//!
//! ```rust
//! use servoloop_mechanism::telemetry::{TelemetryLog, TelemetrySink};
//! use servoloop_types::TelemetryValue;
//!
//! let mut log = TelemetryLog::new();
//! log.add_source("Battery Voltage".to_string(), Box::new(|| TelemetryValue::Number(12.4)));
//!
//! log.save_logs(0.02).unwrap();
//! assert_eq!(log.value("Battery Voltage"), Some(TelemetryValue::Number(12.4)));
//! ```

use std::fmt;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use servoloop_types::{ServoError, TelemetryValue};
use tracing::{trace, warn};

/// Closure producing the current value of one telemetry quantity.
pub type TelemetrySupplier = Box<dyn Fn() -> TelemetryValue + Send + Sync>;

/// Destination for telemetry source registrations.
pub trait TelemetrySink {
    /// Register `supplier` under `label`.  Registering an existing label
    /// replaces its supplier but keeps its position.
    fn add_source(&mut self, label: String, supplier: TelemetrySupplier);
}

/// One labelled sample inside a [`TelemetryFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub label: String,
    pub value: TelemetryValue,
}

/// Every registered source sampled at one scheduler timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Scheduler timestamp in seconds.
    pub timestamp: f64,
    pub recorded_at: DateTime<Utc>,
    pub samples: Vec<TelemetrySample>,
}

// ─────────────────────────────────────────────────────────────────────────────
// TelemetryLog
// ─────────────────────────────────────────────────────────────────────────────

/// In-process telemetry recorder.
#[derive(Default)]
pub struct TelemetryLog {
    sources: Vec<(String, TelemetrySupplier)>,
    latest: Option<TelemetryFrame>,
    writer: Option<Box<dyn Write + Send>>,
    frames_saved: u64,
}

impl fmt::Debug for TelemetryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryLog")
            .field("labels", &self.labels())
            .field("frames_saved", &self.frames_saved)
            .field("has_writer", &self.writer.is_some())
            .finish()
    }
}

impl TelemetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append each saved frame as one JSON line to `writer`.
    pub fn with_writer(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Registered labels in registration order.
    pub fn labels(&self) -> Vec<&str> {
        self.sources.iter().map(|(label, _)| label.as_str()).collect()
    }

    pub fn frames_saved(&self) -> u64 {
        self.frames_saved
    }

    /// Sample every source without recording a frame.
    pub fn sample(&self) -> Vec<TelemetrySample> {
        self.sources
            .iter()
            .map(|(label, supplier)| TelemetrySample {
                label: label.clone(),
                value: supplier(),
            })
            .collect()
    }

    /// Sample every source into a new frame, keep it as the latest frame, and
    /// write it out if a writer is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ServoError::Telemetry`] when the frame cannot be serialised
    /// or written.  The frame is still kept as the latest one.
    pub fn save_logs(&mut self, timestamp: f64) -> Result<(), ServoError> {
        let frame = TelemetryFrame {
            timestamp,
            recorded_at: Utc::now(),
            samples: self.sample(),
        };
        self.frames_saved += 1;
        trace!(timestamp, samples = frame.samples.len(), "telemetry frame saved");

        let result = match self.writer.as_mut() {
            Some(writer) => write_frame(writer, &frame),
            None => Ok(()),
        };
        self.latest = Some(frame);
        result
    }

    /// Push buffered frames through to the writer.  Frames are not flushed
    /// individually; call this when a run phase ends.  Also runs on drop.
    pub fn flush(&mut self) -> Result<(), ServoError> {
        match self.writer.as_mut() {
            Some(writer) => writer
                .flush()
                .map_err(|e| ServoError::Telemetry(format!("failed to flush frames: {e}"))),
            None => Ok(()),
        }
    }

    pub fn latest(&self) -> Option<&TelemetryFrame> {
        self.latest.as_ref()
    }

    /// Value of `label` in the latest saved frame.
    pub fn value(&self, label: &str) -> Option<TelemetryValue> {
        self.latest
            .as_ref()?
            .samples
            .iter()
            .find(|s| s.label == label)
            .map(|s| s.value.clone())
    }
}

impl Drop for TelemetryLog {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "telemetry flush on drop failed");
        }
    }
}

impl TelemetrySink for TelemetryLog {
    fn add_source(&mut self, label: String, supplier: TelemetrySupplier) {
        match self.sources.iter_mut().find(|(existing, _)| *existing == label) {
            Some(slot) => slot.1 = supplier,
            None => self.sources.push((label, supplier)),
        }
    }
}

fn write_frame(writer: &mut Box<dyn Write + Send>, frame: &TelemetryFrame) -> Result<(), ServoError> {
    let line = serde_json::to_string(frame)
        .map_err(|e| ServoError::Telemetry(format!("failed to serialise frame: {e}")))?;
    writeln!(writer, "{line}")
        .map_err(|e| ServoError::Telemetry(format!("failed to write frame: {e}")))
}
