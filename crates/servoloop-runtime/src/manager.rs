//! [`SubsystemManager`] – the composition root's registry of mechanisms.
//!
//! The manager is an ordinary value owned by whoever builds the robot; there
//! is no process-wide registry.  It hands out two composite [`Loop`]s over
//! the same ordered subsystem list:
//!
//! - **enabled**: full `on_start` / `on_loop` / `on_stop` for every
//!   subsystem, followed by a telemetry pass on each tick.
//! - **disabled**: a telemetry pass only; nothing is actuated.
//!
//! Registration order is iteration order, so within one tick a subsystem
//! only ever observes its peers' state from the previous tick or from peers
//! registered ahead of it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use servoloop_mechanism::{Subsystem, TelemetryLog, TelemetrySink, TelemetrySupplier};
use servoloop_types::ServoError;
use tracing::{info, warn};

use crate::looper::Loop;

pub struct SubsystemManager {
    subsystems: Vec<Arc<dyn Subsystem>>,
    telemetry: Arc<Mutex<TelemetryLog>>,
}

impl Default for SubsystemManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsystemManager {
    pub fn new() -> Self {
        Self::with_telemetry(TelemetryLog::new())
    }

    /// Manager recording telemetry into `log` (e.g. one with a JSON-lines
    /// writer attached).
    pub fn with_telemetry(log: TelemetryLog) -> Self {
        Self {
            subsystems: Vec::new(),
            telemetry: Arc::new(Mutex::new(log)),
        }
    }

    /// Register `subsystem`'s telemetry sources and append it to the run
    /// order.
    pub fn register(&mut self, subsystem: Arc<dyn Subsystem>) {
        Arc::clone(&subsystem).register_logging(&mut *lock(&self.telemetry));
        info!(subsystem = %subsystem.name(), index = self.subsystems.len(), "subsystem registered");
        self.subsystems.push(subsystem);
    }

    pub fn register_all(&mut self, subsystems: impl IntoIterator<Item = Arc<dyn Subsystem>>) {
        for subsystem in subsystems {
            self.register(subsystem);
        }
    }

    pub fn subsystems(&self) -> &[Arc<dyn Subsystem>] {
        &self.subsystems
    }

    /// Publish an extra telemetry source outside any subsystem.
    pub fn add_source(&self, label: impl Into<String>, supplier: TelemetrySupplier) {
        lock(&self.telemetry).add_source(label.into(), supplier);
    }

    pub fn telemetry(&self) -> Arc<Mutex<TelemetryLog>> {
        Arc::clone(&self.telemetry)
    }

    /// Every subsystem's `output_telemetry`, then one saved telemetry frame.
    pub fn output_telemetry(&self, timestamp: f64) -> Result<(), ServoError> {
        output_telemetry(&self.subsystems, &self.telemetry, timestamp)
    }

    /// Zero every subsystem's sensors, stopping at the first failure.
    pub fn zero_sensors(&self) -> Result<(), ServoError> {
        self.subsystems.iter().try_for_each(|s| s.zero_sensors())
    }

    /// Self-test every subsystem.  All are checked; the first failure is
    /// returned.
    pub fn check_system(&self) -> Result<(), ServoError> {
        let mut first_error = None;
        for subsystem in &self.subsystems {
            if let Err(e) = subsystem.check_system() {
                warn!(subsystem = %subsystem.name(), error = %e, "system check failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Composite loop actuating every subsystem registered so far.
    pub fn enabled_loop(&self) -> Arc<dyn Loop> {
        Arc::new(EnabledLoop(self.pass()))
    }

    /// Composite loop publishing telemetry for every subsystem registered so
    /// far without actuating anything.
    pub fn disabled_loop(&self) -> Arc<dyn Loop> {
        Arc::new(DisabledLoop(self.pass()))
    }

    fn pass(&self) -> Pass {
        Pass {
            subsystems: self.subsystems.clone(),
            telemetry: Arc::clone(&self.telemetry),
        }
    }
}

fn lock(log: &Mutex<TelemetryLog>) -> MutexGuard<'_, TelemetryLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

fn output_telemetry(
    subsystems: &[Arc<dyn Subsystem>],
    telemetry: &Mutex<TelemetryLog>,
    timestamp: f64,
) -> Result<(), ServoError> {
    for subsystem in subsystems {
        subsystem.output_telemetry();
    }
    lock(telemetry).save_logs(timestamp)
}

// ─────────────────────────────────────────────────────────────────────────────
// Composite loops
// ─────────────────────────────────────────────────────────────────────────────

struct Pass {
    subsystems: Vec<Arc<dyn Subsystem>>,
    telemetry: Arc<Mutex<TelemetryLog>>,
}

impl Pass {
    /// Telemetry failures are logged and never halt actuation.
    fn telemetry(&self, timestamp: f64) {
        if let Err(e) = output_telemetry(&self.subsystems, &self.telemetry, timestamp) {
            warn!(error = %e, "telemetry pass failed");
        }
    }

    fn flush_telemetry(&self) {
        if let Err(e) = lock(&self.telemetry).flush() {
            warn!(error = %e, "telemetry flush failed");
        }
    }
}

struct EnabledLoop(Pass);

impl Loop for EnabledLoop {
    fn name(&self) -> &str {
        "enabled subsystems"
    }

    fn on_start(&self, timestamp: f64) -> Result<(), ServoError> {
        self.0
            .subsystems
            .iter()
            .try_for_each(|s| s.on_start(timestamp))
    }

    fn on_loop(&self, timestamp: f64, dt: f64) -> Result<(), ServoError> {
        for subsystem in &self.0.subsystems {
            subsystem.on_loop(timestamp, dt)?;
        }
        self.0.telemetry(timestamp);
        Ok(())
    }

    fn on_stop(&self, timestamp: f64) -> Result<(), ServoError> {
        let mut first_error = None;
        for subsystem in &self.0.subsystems {
            if let Err(e) = subsystem.on_stop(timestamp) {
                warn!(subsystem = %subsystem.name(), error = %e, "on_stop failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        self.0.flush_telemetry();
        first_error.map_or(Ok(()), Err)
    }
}

struct DisabledLoop(Pass);

impl Loop for DisabledLoop {
    fn name(&self) -> &str {
        "disabled subsystems"
    }

    fn on_start(&self, _timestamp: f64) -> Result<(), ServoError> {
        Ok(())
    }

    fn on_loop(&self, timestamp: f64, _dt: f64) -> Result<(), ServoError> {
        self.0.telemetry(timestamp);
        Ok(())
    }

    fn on_stop(&self, _timestamp: f64) -> Result<(), ServoError> {
        self.0.flush_telemetry();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
