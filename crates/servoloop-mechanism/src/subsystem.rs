//! The [`Subsystem`] contract shared by every mechanism.
//!
//! A subsystem is driven by a periodic scheduler: `on_start` once when a
//! control phase begins, `on_loop` once per period, `on_stop` once when the
//! phase ends.  Subsystems are shared between the scheduler thread and the
//! thread issuing setpoints, so every method takes `&self` and implementors
//! guard their own mutable state.

use std::sync::Arc;

use servoloop_types::ServoError;

use crate::telemetry::TelemetrySink;

pub trait Subsystem: Send + Sync {
    /// Stable name used in logs and telemetry labels.
    fn name(&self) -> &str;

    /// Register this subsystem's telemetry sources.  Called exactly once, when
    /// the subsystem is registered with a manager.
    fn register_logging(self: Arc<Self>, sink: &mut dyn TelemetrySink);

    /// Self-test hook, e.g. verifying that sensors respond.
    fn check_system(&self) -> Result<(), ServoError> {
        Ok(())
    }

    /// Push any per-period telemetry that is not covered by registered
    /// sources.  Runs in both enabled and disabled phases.
    fn output_telemetry(&self) {}

    fn zero_sensors(&self) -> Result<(), ServoError>;

    fn on_start(&self, timestamp: f64) -> Result<(), ServoError>;

    fn on_loop(&self, timestamp: f64, dt: f64) -> Result<(), ServoError>;

    fn on_stop(&self, timestamp: f64) -> Result<(), ServoError>;
}
