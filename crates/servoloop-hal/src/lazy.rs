//! [`LazyDriver`] – suppresses redundant setpoint writes.
//!
//! A servo mechanism re-issues its setpoint on every scheduler tick even when
//! nothing changed.  On a shared CAN bus that is wasted bandwidth, so
//! `LazyDriver` remembers the last (mode, value) pair it forwarded and drops
//! a write that would repeat it.  Reads and configuration calls always pass
//! through.
//!
//! Configuration calls that can change how the controller interprets a
//! setpoint (zeroing, gain slot, constraints) clear the cache so the next
//! setpoint is always forwarded.

use servoloop_types::{PidGains, ServoError};
use tracing::trace;

use crate::driver::{DriverConstraints, HardwareDriver};

/// Setpoint channel of a motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    PercentOutput,
    Position,
    Velocity,
    MotionProfile,
}

/// Wraps a [`HardwareDriver`] and forwards only setpoint writes that differ
/// from the previous one.
///
/// # Example
///
/// ```rust
/// use servoloop_hal::{HardwareDriver, LazyDriver, SimDriver};
///
/// let controller = SimDriver::new("roller");
/// let mut driver = LazyDriver::new(controller.clone());
///
/// driver.set_open_loop(0.4).unwrap();
/// driver.set_open_loop(0.4).unwrap(); // dropped
/// driver.set_open_loop(0.5).unwrap();
///
/// assert_eq!(controller.commands().len(), 2);
/// assert_eq!(driver.suppressed_writes(), 1);
/// ```
pub struct LazyDriver<D> {
    inner: D,
    last_set: Option<(ControlMode, f64)>,
    suppressed: u64,
}

impl<D: HardwareDriver> LazyDriver<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            last_set: None,
            suppressed: 0,
        }
    }

    /// Number of setpoint writes dropped so far.
    pub fn suppressed_writes(&self) -> u64 {
        self.suppressed
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    /// Forget the last forwarded setpoint so the next one always goes out.
    pub fn invalidate(&mut self) {
        self.last_set = None;
    }

    fn set(
        &mut self,
        mode: ControlMode,
        value: f64,
        write: impl FnOnce(&mut D, f64) -> Result<(), ServoError>,
    ) -> Result<(), ServoError> {
        if self.last_set == Some((mode, value)) {
            self.suppressed += 1;
            trace!(driver = %self.inner.id(), ?mode, value, "suppressed repeated setpoint");
            return Ok(());
        }
        write(&mut self.inner, value)?;
        // Only cache after the write landed so a failed write is re-sent.
        self.last_set = Some((mode, value));
        Ok(())
    }
}

impl<D: HardwareDriver> HardwareDriver for LazyDriver<D> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn position_ticks(&self) -> Result<i32, ServoError> {
        self.inner.position_ticks()
    }

    fn velocity_ticks_per_100ms(&self) -> Result<i32, ServoError> {
        self.inner.velocity_ticks_per_100ms()
    }

    fn set_open_loop(&mut self, percent: f64) -> Result<(), ServoError> {
        self.set(ControlMode::PercentOutput, percent, |d, v| d.set_open_loop(v))
    }

    fn set_position(&mut self, ticks: f64) -> Result<(), ServoError> {
        self.set(ControlMode::Position, ticks, |d, v| d.set_position(v))
    }

    fn set_velocity(&mut self, units_per_second: f64) -> Result<(), ServoError> {
        self.set(ControlMode::Velocity, units_per_second, |d, v| {
            d.set_velocity(v)
        })
    }

    fn set_motion_profile(&mut self, ticks: f64) -> Result<(), ServoError> {
        self.set(ControlMode::MotionProfile, ticks, |d, v| {
            d.set_motion_profile(v)
        })
    }

    fn apply_pid_gains(&mut self, gains: &PidGains) -> Result<(), ServoError> {
        self.invalidate();
        self.inner.apply_pid_gains(gains)
    }

    fn apply_motion_constraints(
        &mut self,
        constraints: &DriverConstraints,
    ) -> Result<(), ServoError> {
        self.invalidate();
        self.inner.apply_motion_constraints(constraints)
    }

    fn zero_sensors(&mut self) -> Result<(), ServoError> {
        self.invalidate();
        self.inner.zero_sensors()
    }

    fn pid_slot(&self) -> u8 {
        self.inner.pid_slot()
    }

    fn set_pid_slot(&mut self, slot: u8) -> Result<(), ServoError> {
        self.invalidate();
        self.inner.set_pid_slot(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DriverCommand, SimDriver};

    #[test]
    fn same_value_different_mode_is_forwarded() {
        let controller = SimDriver::new("a");
        let mut driver = LazyDriver::new(controller.clone());
        driver.set_position(100.0).unwrap();
        driver.set_motion_profile(100.0).unwrap();
        assert_eq!(
            controller.commands(),
            vec![DriverCommand::Position(100.0), DriverCommand::MotionProfile(100.0)]
        );
        assert_eq!(driver.suppressed_writes(), 0);
    }

    #[test]
    fn zeroing_clears_the_cache() {
        let controller = SimDriver::new("a");
        let mut driver = LazyDriver::new(controller.clone());
        driver.set_open_loop(0.0).unwrap();
        driver.zero_sensors().unwrap();
        driver.set_open_loop(0.0).unwrap();
        assert_eq!(controller.setpoint_commands().len(), 2);
    }

    #[test]
    fn failed_write_is_not_cached() {
        let controller = SimDriver::new("a");
        let mut driver = LazyDriver::new(controller.clone());
        controller.inject_fault("bus off");
        assert!(driver.set_velocity(5.0).is_err());
        driver.set_velocity(5.0).unwrap();
        assert_eq!(controller.setpoint_commands(), vec![DriverCommand::Velocity(5.0)]);
    }

    #[test]
    fn reads_pass_through() {
        let controller = SimDriver::new("a");
        let driver = LazyDriver::new(controller.clone());
        controller.set_position_ticks(77);
        assert_eq!(driver.position_ticks().unwrap(), 77);
        assert_eq!(driver.id(), "a");
        assert_eq!(driver.inner().id(), "a");
    }
}
