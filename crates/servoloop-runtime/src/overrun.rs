//! [`OverrunDetector`] – scheduler health monitor.
//!
//! Registered as an ordinary [`Loop`] participant, the detector compares
//! every observed `dt` against the nominal period and counts the ticks that
//! ran late.  Each overrun is logged with `warn!`; the totals are reported
//! when the looper stops and can be read at any time through
//! [`OverrunDetector::stats`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use servoloop_types::ServoError;
use tracing::{info, warn};

use crate::looper::Loop;

/// Default multiple of the nominal period above which a tick counts as late.
pub const DEFAULT_OVERRUN_FACTOR: f64 = 1.5;

/// Tick timing totals since the owning looper last started.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OverrunStats {
    pub ticks: u64,
    pub overruns: u64,
    /// Largest `dt` observed, in seconds.
    pub worst_dt: f64,
}

pub struct OverrunDetector {
    name: String,
    nominal: Duration,
    factor: f64,
    stats: Mutex<OverrunStats>,
}

impl OverrunDetector {
    pub fn new(name: impl Into<String>, nominal: Duration) -> Self {
        Self::with_factor(name, nominal, DEFAULT_OVERRUN_FACTOR)
    }

    /// Flag ticks whose `dt` exceeds `factor × nominal`.
    pub fn with_factor(name: impl Into<String>, nominal: Duration, factor: f64) -> Self {
        Self {
            name: name.into(),
            nominal,
            factor,
            stats: Mutex::new(OverrunStats::default()),
        }
    }

    /// Threshold in seconds above which a tick is late.
    pub fn threshold(&self) -> f64 {
        self.nominal.as_secs_f64() * self.factor
    }

    pub fn is_overrun(&self, dt: f64) -> bool {
        dt > self.threshold()
    }

    pub fn stats(&self) -> OverrunStats {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, OverrunStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Loop for OverrunDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&self, _timestamp: f64) -> Result<(), ServoError> {
        *self.lock() = OverrunStats::default();
        Ok(())
    }

    fn on_loop(&self, timestamp: f64, dt: f64) -> Result<(), ServoError> {
        let late = self.is_overrun(dt);
        let mut stats = self.lock();
        stats.ticks += 1;
        stats.worst_dt = stats.worst_dt.max(dt);
        if late {
            stats.overruns += 1;
            warn!(
                detector = %self.name,
                timestamp,
                dt,
                threshold = self.threshold(),
                overruns = stats.overruns,
                "loop overrun"
            );
        }
        Ok(())
    }

    fn on_stop(&self, _timestamp: f64) -> Result<(), ServoError> {
        let stats = self.stats();
        info!(
            detector = %self.name,
            ticks = stats.ticks,
            overruns = stats.overruns,
            worst_dt = stats.worst_dt,
            "loop timing summary"
        );
        Ok(())
    }
}
