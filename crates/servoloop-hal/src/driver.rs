//! Generic `HardwareDriver` trait for closed-loop motor controllers.
//!
//! A driver exposes raw sensor reads in encoder ticks and accepts exactly the
//! commands a smart motor controller understands: open-loop duty cycle,
//! onboard position/velocity PID, and onboard motion profiling.  It contains
//! no control logic of its own; unit conversion and state selection live in
//! the mechanism that owns it.

use servoloop_types::{PidGains, ServoError};

/// Motion constraints expressed in the driver's native tick units.
///
/// A soft limit of `None` disables that limit on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConstraints {
    pub reverse_soft_limit_ticks: Option<i32>,
    pub forward_soft_limit_ticks: Option<i32>,
    pub cruise_velocity_ticks_per_100ms: i32,
    pub max_accel_ticks_per_100ms: i32,
    pub curve_strength: i32,
    /// Gain slot the onboard motion profiler closes its loop with.
    pub pid_slot: u8,
    pub brake_mode: bool,
}

impl DriverConstraints {
    pub fn has_reverse_limit(&self) -> bool {
        self.reverse_soft_limit_ticks.is_some()
    }

    pub fn has_forward_limit(&self) -> bool {
        self.forward_soft_limit_ticks.is_some()
    }
}

/// A motor controller with an attached encoder.
///
/// Every method may fail with [`ServoError::HardwareFault`] (bus timeout,
/// controller fault, ...).  Callers propagate these errors; drivers should not
/// retry internally.
pub trait HardwareDriver: Send {
    /// Stable identifier, e.g. `"arm_talon"` or `"CAN 7"`.
    fn id(&self) -> &str;

    /// Raw encoder position in ticks.
    fn position_ticks(&self) -> Result<i32, ServoError>;

    /// Raw encoder velocity in ticks per 100 ms.
    fn velocity_ticks_per_100ms(&self) -> Result<i32, ServoError>;

    /// Command a duty cycle in `[-1, 1]` (not enforced here).
    fn set_open_loop(&mut self, percent: f64) -> Result<(), ServoError>;

    /// Command an onboard position PID target in ticks.
    fn set_position(&mut self, ticks: f64) -> Result<(), ServoError>;

    /// Command an onboard velocity PID target.  The conversion from units per
    /// second is the driver's responsibility.
    fn set_velocity(&mut self, units_per_second: f64) -> Result<(), ServoError>;

    /// Command an onboard motion-profiled position target in ticks.
    fn set_motion_profile(&mut self, ticks: f64) -> Result<(), ServoError>;

    /// Write one gain set into the slot named by `gains.slot`.
    fn apply_pid_gains(&mut self, gains: &PidGains) -> Result<(), ServoError>;

    fn apply_motion_constraints(&mut self, constraints: &DriverConstraints)
    -> Result<(), ServoError>;

    /// Reset the encoder position to zero.
    fn zero_sensors(&mut self) -> Result<(), ServoError>;

    /// Currently selected onboard gain slot.
    fn pid_slot(&self) -> u8;

    fn set_pid_slot(&mut self, slot: u8) -> Result<(), ServoError>;
}
