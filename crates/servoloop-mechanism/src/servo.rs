//! [`ServoMotorSubsystem`] – closed-loop control of one physical mechanism.
//!
//! The subsystem owns a [`HardwareDriver`] and a small runtime record: the
//! active [`ControlState`] plus one setpoint per control mode.  Setting a
//! setpoint is the only way to change the control state.  On every scheduler
//! tick [`Subsystem::on_loop`] issues exactly one hardware write matching the
//! active state.
//!
//! # Concurrency
//!
//! Setpoints are written from the operator/autonomous thread while the
//! scheduler thread ticks the mechanism.  The control state, all four
//! setpoints, and the driver sit behind a single [`Mutex`]; every getter and
//! setter takes it once, so a "check state, switch slot, store value" update
//! is never observed half-applied.
//!
//! # PID slots
//!
//! Motion magic and velocity PID close the loop on velocity feedback and share
//! the velocity gain slot; position PID uses the position gain slot.  The slot
//! is written to the driver only when a transition changes the feedback
//! category, keeping configuration traffic off the hot path.  A setter whose
//! feedback category is already active only stores its value: the
//! motion-profile setter leaves velocity PID in place and vice versa.
//!
//! # Example
//!
//! ```rust
//! use servoloop_hal::{DriverCommand, SimDriver};
//! use servoloop_mechanism::{ServoMotorSubsystem, Subsystem};
//! use servoloop_types::{ControlState, MechanismConfig, MotionConstraints, PidGains};
//!
//! let gains = PidGains { slot: 0, kp: 0.1, ki: 0.0, kd: 0.0, kf: 0.05 };
//! let config = MechanismConfig {
//!     name: "turret".to_string(),
//!     units_name: "degrees".to_string(),
//!     position_pid_gains: PidGains { slot: 1, ..gains },
//!     velocity_pid_gains: gains,
//!     home_position: 0.0,
//!     motion_constraints: MotionConstraints {
//!         reverse_soft_limit: None,
//!         forward_soft_limit: None,
//!         cruise_velocity: 100.0,
//!         max_accel: 200.0,
//!         curve_strength: 0,
//!     },
//!     ticks_per_unit_distance: 4096.0 / 360.0,
//!     brake_mode: false,
//! };
//!
//! let controller = SimDriver::new("turret_talon");
//! let turret = ServoMotorSubsystem::new(config, controller.clone()).unwrap();
//!
//! turret.set_velocity_setpoint(150.0).unwrap();
//! assert_eq!(turret.control_state(), ControlState::VelocityPid);
//!
//! controller.take_commands();
//! turret.on_loop(0.02, 0.02).unwrap();
//! assert_eq!(controller.commands(), vec![DriverCommand::Velocity(100.0)]);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use servoloop_hal::{DriverConstraints, HardwareDriver};
use servoloop_types::{ControlState, MechanismConfig, ServoError, TelemetryValue};
use tracing::{debug, info, warn};

use crate::subsystem::Subsystem;
use crate::telemetry::TelemetrySink;
use crate::units::UnitConverter;

// ─────────────────────────────────────────────────────────────────────────────
// Runtime state
// ─────────────────────────────────────────────────────────────────────────────

/// Consistent snapshot of a mechanism's control state and setpoints.
///
/// Only the setpoint belonging to `control_state` is authoritative; the
/// others hold whatever was last stored (initially zero).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServoSetpoints {
    pub control_state: ControlState,
    pub position_setpoint_motion_profile: f64,
    pub position_setpoint_position_pid: f64,
    pub velocity_setpoint: f64,
    pub open_loop_power: f64,
}

struct ServoState<H> {
    hardware: H,
    control_state: ControlState,
    position_setpoint_motion_profile: f64,
    position_setpoint_position_pid: f64,
    velocity_setpoint: f64,
    open_loop_power: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// ServoMotorSubsystem
// ─────────────────────────────────────────────────────────────────────────────

/// A mechanism driven through position, velocity, motion-profiled, and
/// open-loop control modes.
pub struct ServoMotorSubsystem<H> {
    config: MechanismConfig,
    units: UnitConverter,
    state: Mutex<ServoState<H>>,
}

impl<H: HardwareDriver> ServoMotorSubsystem<H> {
    /// Validate `config`, push motion constraints and both gain sets to the
    /// driver, and zero the sensors.
    ///
    /// # Errors
    ///
    /// Returns [`ServoError::InvalidConfig`] for an invalid configuration
    /// (nothing is written to the driver), or the driver's error if any of
    /// the initial configuration writes fails.
    pub fn new(config: MechanismConfig, hardware: H) -> Result<Self, ServoError> {
        config.validate()?;
        let units = UnitConverter::new(config.ticks_per_unit_distance, config.home_position);
        let subsystem = Self {
            config,
            units,
            state: Mutex::new(ServoState {
                hardware,
                control_state: ControlState::OpenLoop,
                position_setpoint_motion_profile: 0.0,
                position_setpoint_position_pid: 0.0,
                velocity_setpoint: 0.0,
                open_loop_power: 0.0,
            }),
        };
        {
            let mut st = subsystem.lock();
            subsystem.push_motion_constraints(&mut st.hardware)?;
            subsystem.push_pid_gains(&mut st.hardware)?;
            st.hardware.zero_sensors()?;
        }
        info!(
            mechanism = %subsystem.config.name,
            driver = %subsystem.lock().hardware.id(),
            "servo mechanism constructed"
        );
        Ok(subsystem)
    }

    fn lock(&self) -> MutexGuard<'_, ServoState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &MechanismConfig {
        &self.config
    }

    pub fn units(&self) -> &UnitConverter {
        &self.units
    }

    /// Run `f` with shared access to the driver while holding the state lock.
    pub fn with_hardware<R>(&self, f: impl FnOnce(&H) -> R) -> R {
        f(&self.lock().hardware)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn control_state(&self) -> ControlState {
        self.lock().control_state
    }

    pub fn setpoints(&self) -> ServoSetpoints {
        let st = self.lock();
        ServoSetpoints {
            control_state: st.control_state,
            position_setpoint_motion_profile: st.position_setpoint_motion_profile,
            position_setpoint_position_pid: st.position_setpoint_position_pid,
            velocity_setpoint: st.velocity_setpoint,
            open_loop_power: st.open_loop_power,
        }
    }

    /// Current position in physical units, re-read from the driver.
    pub fn position(&self) -> Result<f64, ServoError> {
        let ticks = self.lock().hardware.position_ticks()?;
        Ok(self.units.ticks_to_homed_units(ticks))
    }

    /// Current velocity in physical units per second, re-read from the driver.
    pub fn velocity(&self) -> Result<f64, ServoError> {
        let ticks = self.lock().hardware.velocity_ticks_per_100ms()?;
        Ok(self.units.ticks_per_100ms_to_units_per_second(ticks))
    }

    // ── Setpoints ────────────────────────────────────────────────────────────

    /// Store a motion-profile target clamped to the soft limits.  Enters
    /// [`ControlState::MotionMagic`] unless the active state already closes
    /// the loop on velocity feedback.
    ///
    /// # Errors
    ///
    /// [`ServoError::InvalidSetpoint`] for a non-finite target, or the
    /// driver's error if the slot write fails.  Either way nothing changes.
    pub fn set_position_setpoint_motion_profile(&self, units: f64) -> Result<(), ServoError> {
        self.require_finite("motion profile position", units)?;
        let mut st = self.lock();
        if !st.control_state.uses_velocity_feedback() {
            self.transition(&mut st, ControlState::MotionMagic)?;
        }
        st.position_setpoint_motion_profile = self.config.motion_constraints.clamp_position(units);
        Ok(())
    }

    /// Store a position-PID target clamped to the soft limits.  Enters
    /// [`ControlState::PositionPid`] unless the active state already uses
    /// position feedback.
    pub fn set_position_setpoint_position_pid(&self, units: f64) -> Result<(), ServoError> {
        self.require_finite("position PID position", units)?;
        let mut st = self.lock();
        if !st.control_state.uses_position_feedback() {
            self.transition(&mut st, ControlState::PositionPid)?;
        }
        st.position_setpoint_position_pid = self.config.motion_constraints.clamp_position(units);
        Ok(())
    }

    /// Store a velocity target clamped to `±cruise_velocity`.  Enters
    /// [`ControlState::VelocityPid`] unless the active state already closes
    /// the loop on velocity feedback.
    pub fn set_velocity_setpoint(&self, units_per_second: f64) -> Result<(), ServoError> {
        self.require_finite("velocity", units_per_second)?;
        let mut st = self.lock();
        if !st.control_state.uses_velocity_feedback() {
            self.transition(&mut st, ControlState::VelocityPid)?;
        }
        st.velocity_setpoint = self.config.motion_constraints.clamp_velocity(units_per_second);
        Ok(())
    }

    fn require_finite(&self, what: &str, value: f64) -> Result<(), ServoError> {
        if value.is_finite() {
            return Ok(());
        }
        warn!(mechanism = %self.config.name, value, "rejected {what} setpoint");
        Err(ServoError::InvalidSetpoint {
            mechanism: self.config.name.clone(),
            details: format!("{what} setpoint must be finite, got {value}"),
        })
    }

    /// Command a raw duty cycle.  The value is stored unclamped.
    pub fn set_open_loop_power(&self, percent: f64) {
        let mut st = self.lock();
        if st.control_state != ControlState::OpenLoop {
            debug!(
                mechanism = %self.config.name,
                from = %st.control_state,
                to = %ControlState::OpenLoop,
                "control state transition"
            );
            st.control_state = ControlState::OpenLoop;
        }
        st.open_loop_power = percent;
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Push both configured gain sets (velocity slot first) to the driver.
    pub fn update_pid_gains(&self) -> Result<(), ServoError> {
        let mut st = self.lock();
        self.push_pid_gains(&mut st.hardware)
    }

    /// Push the configured motion constraints, converted to ticks, to the
    /// driver.
    pub fn update_motion_constraints(&self) -> Result<(), ServoError> {
        let mut st = self.lock();
        self.push_motion_constraints(&mut st.hardware)
    }

    /// The tick-space constraint bundle written by
    /// [`update_motion_constraints`](Self::update_motion_constraints).
    pub fn driver_constraints(&self) -> DriverConstraints {
        let mc = &self.config.motion_constraints;
        DriverConstraints {
            reverse_soft_limit_ticks: mc
                .reverse_soft_limit
                .map(|limit| self.units.home_aware_units_to_ticks(limit)),
            forward_soft_limit_ticks: mc
                .forward_soft_limit
                .map(|limit| self.units.home_aware_units_to_ticks(limit)),
            cruise_velocity_ticks_per_100ms: self
                .units
                .units_per_second_to_ticks_per_100ms(mc.cruise_velocity),
            max_accel_ticks_per_100ms: self.units.units_per_second_to_ticks_per_100ms(mc.max_accel),
            curve_strength: mc.curve_strength,
            pid_slot: self.config.velocity_pid_gains.slot,
            brake_mode: self.config.brake_mode,
        }
    }

    fn push_pid_gains(&self, hardware: &mut H) -> Result<(), ServoError> {
        hardware.apply_pid_gains(&self.config.velocity_pid_gains)?;
        hardware.apply_pid_gains(&self.config.position_pid_gains)?;
        info!(mechanism = %self.config.name, "updated PID gains");
        Ok(())
    }

    fn push_motion_constraints(&self, hardware: &mut H) -> Result<(), ServoError> {
        hardware.apply_motion_constraints(&self.driver_constraints())?;
        info!(mechanism = %self.config.name, "updated motion constraints");
        Ok(())
    }

    // ── State machine ────────────────────────────────────────────────────────

    fn transition(&self, st: &mut ServoState<H>, target: ControlState) -> Result<(), ServoError> {
        let from = st.control_state;
        if from == target {
            return Ok(());
        }
        if target.uses_velocity_feedback() && !from.uses_velocity_feedback() {
            self.enter_velocity_closed_loop(&mut st.hardware)?;
        } else if target.uses_position_feedback() && !from.uses_position_feedback() {
            self.enter_position_closed_loop(&mut st.hardware)?;
        }
        debug!(
            mechanism = %self.config.name,
            %from,
            to = %target,
            "control state transition"
        );
        st.control_state = target;
        Ok(())
    }

    fn enter_velocity_closed_loop(&self, hardware: &mut H) -> Result<(), ServoError> {
        let slot = self.config.velocity_pid_gains.slot;
        hardware.set_pid_slot(slot)?;
        info!(mechanism = %self.config.name, slot, "entered velocity closed loop");
        Ok(())
    }

    fn enter_position_closed_loop(&self, hardware: &mut H) -> Result<(), ServoError> {
        let slot = self.config.position_pid_gains.slot;
        hardware.set_pid_slot(slot)?;
        info!(mechanism = %self.config.name, slot, "entered position closed loop");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subsystem
// ─────────────────────────────────────────────────────────────────────────────

impl<H: HardwareDriver + 'static> Subsystem for ServoMotorSubsystem<H> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn register_logging(self: Arc<Self>, sink: &mut dyn TelemetrySink) {
        let name = self.config.name.clone();
        let units = self.config.units_name.clone();

        let me = Arc::clone(&self);
        sink.add_source(
            format!("{name} State"),
            Box::new(move || TelemetryValue::from(me.control_state().as_str())),
        );

        let me = Arc::clone(&self);
        sink.add_source(
            format!("{name} Position ({units})"),
            Box::new(move || TelemetryValue::Number(sample_or_nan(&me.config.name, me.position()))),
        );

        let me = self;
        sink.add_source(
            format!("{name} Velocity ({units}/s)"),
            Box::new(move || TelemetryValue::Number(sample_or_nan(&me.config.name, me.velocity()))),
        );
    }

    fn check_system(&self) -> Result<(), ServoError> {
        let st = self.lock();
        st.hardware.position_ticks()?;
        st.hardware.velocity_ticks_per_100ms()?;
        Ok(())
    }

    fn zero_sensors(&self) -> Result<(), ServoError> {
        self.lock().hardware.zero_sensors()
    }

    fn on_start(&self, _timestamp: f64) -> Result<(), ServoError> {
        self.set_open_loop_power(0.0);
        self.zero_sensors()
    }

    fn on_loop(&self, _timestamp: f64, _dt: f64) -> Result<(), ServoError> {
        let mut st = self.lock();
        match st.control_state {
            ControlState::MotionMagic => {
                let ticks = self
                    .units
                    .home_aware_units_to_ticks(st.position_setpoint_motion_profile);
                st.hardware.set_motion_profile(f64::from(ticks))
            }
            ControlState::OpenLoop => {
                let power = st.open_loop_power;
                st.hardware.set_open_loop(power)
            }
            ControlState::PositionPid => {
                let ticks = self
                    .units
                    .home_aware_units_to_ticks(st.position_setpoint_position_pid);
                st.hardware.set_position(f64::from(ticks))
            }
            ControlState::VelocityPid => {
                let velocity = st.velocity_setpoint;
                st.hardware.set_velocity(velocity)
            }
        }
    }

    fn on_stop(&self, _timestamp: f64) -> Result<(), ServoError> {
        self.set_open_loop_power(0.0);
        Ok(())
    }
}

fn sample_or_nan(mechanism: &str, reading: Result<f64, ServoError>) -> f64 {
    reading.unwrap_or_else(|e| {
        warn!(%mechanism, error = %e, "telemetry read failed");
        f64::NAN
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
