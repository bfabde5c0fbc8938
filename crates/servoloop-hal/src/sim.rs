//! In-process simulated motor controller for CI/CD testing without hardware.
//!
//! [`SimDriver`] implements [`HardwareDriver`] by recording every command it
//! receives and reporting whatever encoder ticks were last injected.  No
//! physics is simulated: the position only changes when a test (or the CLI)
//! injects it, or when sensors are zeroed.
//!
//! `SimDriver` is a cheap handle around shared state, so a test can keep a
//! clone after moving the driver into a mechanism and inspect the command log.
//!
//! # Example
//!
//! ```rust
//! use servoloop_hal::sim::{DriverCommand, SimDriver};
//! use servoloop_hal::HardwareDriver;
//!
//! let controller = SimDriver::new("wrist_talon");
//! let mut driver = controller.clone();
//!
//! driver.set_open_loop(0.5).unwrap();
//! controller.set_position_ticks(1024);
//!
//! assert_eq!(driver.position_ticks().unwrap(), 1024);
//! assert_eq!(controller.commands(), vec![DriverCommand::OpenLoop(0.5)]);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use servoloop_types::{PidGains, ServoError};

use crate::driver::{DriverConstraints, HardwareDriver};

// ────────────────────────────────────────────────────────────────────────────
// Command log
// ────────────────────────────────────────────────────────────────────────────

/// One call received by a [`SimDriver`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    OpenLoop(f64),
    Position(f64),
    Velocity(f64),
    MotionProfile(f64),
    PidGains(PidGains),
    MotionConstraints(DriverConstraints),
    PidSlot(u8),
    ZeroSensors,
}

impl DriverCommand {
    /// `true` for the four per-tick setpoint writes.
    pub fn is_setpoint(&self) -> bool {
        matches!(
            self,
            DriverCommand::OpenLoop(_)
                | DriverCommand::Position(_)
                | DriverCommand::Velocity(_)
                | DriverCommand::MotionProfile(_)
        )
    }
}

#[derive(Default)]
struct SimState {
    position_ticks: i32,
    velocity_ticks_per_100ms: i32,
    pid_slot: u8,
    commands: Vec<DriverCommand>,
    pending_fault: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// SimDriver
// ────────────────────────────────────────────────────────────────────────────

/// A simulated motor controller.  Always succeeds unless a fault has been
/// armed with [`SimDriver::inject_fault`].
#[derive(Clone)]
pub struct SimDriver {
    id: String,
    state: Arc<Mutex<SimState>>,
}

impl SimDriver {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the raw encoder position reported by subsequent reads.
    pub fn set_position_ticks(&self, ticks: i32) {
        self.state().position_ticks = ticks;
    }

    /// Set the raw encoder velocity reported by subsequent reads.
    pub fn set_velocity_ticks_per_100ms(&self, ticks: i32) {
        self.state().velocity_ticks_per_100ms = ticks;
    }

    /// Make the next write (setpoint or configuration) fail with a
    /// [`ServoError::HardwareFault`] carrying `details`.
    pub fn inject_fault(&self, details: impl Into<String>) {
        self.state().pending_fault = Some(details.into());
    }

    /// Snapshot of every command received so far.
    pub fn commands(&self) -> Vec<DriverCommand> {
        self.state().commands.clone()
    }

    /// Only the per-tick setpoint writes, in order.
    pub fn setpoint_commands(&self) -> Vec<DriverCommand> {
        self.state()
            .commands
            .iter()
            .filter(|c| c.is_setpoint())
            .cloned()
            .collect()
    }

    /// Drain the command log.
    pub fn take_commands(&self) -> Vec<DriverCommand> {
        std::mem::take(&mut self.state().commands)
    }

    fn record(&self, command: DriverCommand) -> Result<(), ServoError> {
        let mut state = self.state();
        if let Some(details) = state.pending_fault.take() {
            return Err(ServoError::HardwareFault {
                component: self.id.clone(),
                details,
            });
        }
        state.commands.push(command);
        Ok(())
    }
}

impl HardwareDriver for SimDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn position_ticks(&self) -> Result<i32, ServoError> {
        Ok(self.state().position_ticks)
    }

    fn velocity_ticks_per_100ms(&self) -> Result<i32, ServoError> {
        Ok(self.state().velocity_ticks_per_100ms)
    }

    fn set_open_loop(&mut self, percent: f64) -> Result<(), ServoError> {
        self.record(DriverCommand::OpenLoop(percent))
    }

    fn set_position(&mut self, ticks: f64) -> Result<(), ServoError> {
        self.record(DriverCommand::Position(ticks))
    }

    fn set_velocity(&mut self, units_per_second: f64) -> Result<(), ServoError> {
        self.record(DriverCommand::Velocity(units_per_second))
    }

    fn set_motion_profile(&mut self, ticks: f64) -> Result<(), ServoError> {
        self.record(DriverCommand::MotionProfile(ticks))
    }

    fn apply_pid_gains(&mut self, gains: &PidGains) -> Result<(), ServoError> {
        self.record(DriverCommand::PidGains(*gains))
    }

    fn apply_motion_constraints(
        &mut self,
        constraints: &DriverConstraints,
    ) -> Result<(), ServoError> {
        self.record(DriverCommand::MotionConstraints(*constraints))
    }

    fn zero_sensors(&mut self) -> Result<(), ServoError> {
        self.record(DriverCommand::ZeroSensors)?;
        self.state().position_ticks = 0;
        Ok(())
    }

    fn pid_slot(&self) -> u8 {
        self.state().pid_slot
    }

    fn set_pid_slot(&mut self, slot: u8) -> Result<(), ServoError> {
        self.record(DriverCommand::PidSlot(slot))?;
        self.state().pid_slot = slot;
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let controller = SimDriver::new("a");
        let mut driver = controller.clone();
        driver.set_velocity(12.5).unwrap();
        controller.set_velocity_ticks_per_100ms(-40);
        assert_eq!(driver.velocity_ticks_per_100ms().unwrap(), -40);
        assert_eq!(controller.commands(), vec![DriverCommand::Velocity(12.5)]);
    }

    #[test]
    fn zero_sensors_resets_position() {
        let mut driver = SimDriver::new("a");
        driver.set_position_ticks(900);
        driver.zero_sensors().unwrap();
        assert_eq!(driver.position_ticks().unwrap(), 0);
        assert_eq!(driver.commands(), vec![DriverCommand::ZeroSensors]);
    }

    #[test]
    fn pid_slot_is_tracked_and_logged() {
        let mut driver = SimDriver::new("a");
        assert_eq!(driver.pid_slot(), 0);
        driver.set_pid_slot(3).unwrap();
        assert_eq!(driver.pid_slot(), 3);
        assert_eq!(driver.commands(), vec![DriverCommand::PidSlot(3)]);
    }

    #[test]
    fn injected_fault_fails_exactly_one_write() {
        let mut driver = SimDriver::new("arm_talon");
        driver.inject_fault("CAN frame lost");

        let err = driver.set_open_loop(0.3).unwrap_err();
        match err {
            ServoError::HardwareFault { component, details } => {
                assert_eq!(component, "arm_talon");
                assert_eq!(details, "CAN frame lost");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(driver.commands().is_empty());

        driver.set_open_loop(0.3).unwrap();
        assert_eq!(driver.commands(), vec![DriverCommand::OpenLoop(0.3)]);
    }

    #[test]
    fn setpoint_filter_skips_configuration() {
        let mut driver = SimDriver::new("a");
        driver.set_pid_slot(1).unwrap();
        driver.set_position(10.0).unwrap();
        driver.zero_sensors().unwrap();
        driver.set_motion_profile(20.0).unwrap();
        assert_eq!(
            driver.setpoint_commands(),
            vec![DriverCommand::Position(10.0), DriverCommand::MotionProfile(20.0)]
        );
        assert_eq!(driver.take_commands().len(), 4);
        assert!(driver.commands().is_empty());
    }
}
