//! `servoloop-types` – shared data contracts for the servoloop stack.
//!
//! Everything in here is plain data: mechanism configuration, the control
//! state tag with its feedback lookup table, telemetry values, and the
//! workspace-wide [`ServoError`] taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Gains and constraints
// ─────────────────────────────────────────────────────────────────────────────

/// One onboard gain slot of a motor controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    /// Index of the hardware slot these gains are written to.
    pub slot: u8,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Feed-forward gain.
    pub kf: f64,
}

/// Soft limits and motion-profile constraints, in physical units.
///
/// A soft limit of `None` leaves that side of travel unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_soft_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_soft_limit: Option<f64>,
    /// Cruise velocity in units per second; also the velocity setpoint bound.
    pub cruise_velocity: f64,
    /// Maximum acceleration in units per second squared.
    pub max_accel: f64,
    /// S-curve smoothing passed through to the onboard motion profiler.
    #[serde(default)]
    pub curve_strength: i32,
}

impl MotionConstraints {
    /// Clamp a position to the soft limits. Missing limits do not clamp.
    pub fn clamp_position(&self, units: f64) -> f64 {
        let lower = self.reverse_soft_limit.unwrap_or(f64::NEG_INFINITY);
        let upper = self.forward_soft_limit.unwrap_or(f64::INFINITY);
        units.max(lower).min(upper)
    }

    /// Clamp a velocity to `[-cruise_velocity, cruise_velocity]`.
    pub fn clamp_velocity(&self, units_per_second: f64) -> f64 {
        units_per_second.clamp(-self.cruise_velocity, self.cruise_velocity)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MechanismConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable description of a single servo mechanism.
///
/// # Example
///
/// ```
/// use servoloop_types::{MechanismConfig, MotionConstraints, PidGains};
///
/// let gains = PidGains { slot: 0, kp: 0.1, ki: 0.0, kd: 0.0, kf: 0.0 };
/// let config = MechanismConfig {
///     name: "wrist".to_string(),
///     units_name: "degrees".to_string(),
///     position_pid_gains: PidGains { slot: 1, ..gains },
///     velocity_pid_gains: gains,
///     home_position: 0.0,
///     motion_constraints: MotionConstraints {
///         reverse_soft_limit: Some(-10.0),
///         forward_soft_limit: Some(90.0),
///         cruise_velocity: 180.0,
///         max_accel: 360.0,
///         curve_strength: 0,
///     },
///     ticks_per_unit_distance: 4096.0 / 360.0,
///     brake_mode: true,
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MechanismConfig {
    pub name: String,
    /// Label of the physical unit, e.g. `"degrees"` or `"meters"`.
    pub units_name: String,
    pub position_pid_gains: PidGains,
    pub velocity_pid_gains: PidGains,
    /// Physical-unit offset subtracted from the converted raw position.
    #[serde(default)]
    pub home_position: f64,
    pub motion_constraints: MotionConstraints,
    /// Encoder resolution divided by physical units per encoder revolution.
    pub ticks_per_unit_distance: f64,
    #[serde(default)]
    pub brake_mode: bool,
}

impl MechanismConfig {
    /// Check the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ServoError::InvalidConfig`] when `ticks_per_unit_distance`
    /// is not a positive finite number, a numeric field is not finite, a
    /// velocity/acceleration bound is negative, or the reverse soft limit
    /// lies above the forward soft limit.
    pub fn validate(&self) -> Result<(), ServoError> {
        let invalid = |details: String| ServoError::InvalidConfig {
            mechanism: self.name.clone(),
            details,
        };

        if self.name.is_empty() {
            return Err(invalid("mechanism name must not be empty".to_string()));
        }
        if !(self.ticks_per_unit_distance.is_finite() && self.ticks_per_unit_distance > 0.0) {
            return Err(invalid(format!(
                "ticks_per_unit_distance must be positive, got {}",
                self.ticks_per_unit_distance
            )));
        }
        if !self.home_position.is_finite() {
            return Err(invalid(format!(
                "home_position must be finite, got {}",
                self.home_position
            )));
        }

        let mc = &self.motion_constraints;
        for (label, limit) in [
            ("reverse_soft_limit", mc.reverse_soft_limit),
            ("forward_soft_limit", mc.forward_soft_limit),
        ] {
            if let Some(value) = limit
                && !value.is_finite()
            {
                return Err(invalid(format!("{label} must be finite, got {value}")));
            }
        }
        if let (Some(reverse), Some(forward)) = (mc.reverse_soft_limit, mc.forward_soft_limit)
            && reverse > forward
        {
            return Err(invalid(format!(
                "reverse_soft_limit {reverse} exceeds forward_soft_limit {forward}"
            )));
        }
        if !(mc.cruise_velocity.is_finite() && mc.cruise_velocity >= 0.0) {
            return Err(invalid(format!(
                "cruise_velocity must be non-negative, got {}",
                mc.cruise_velocity
            )));
        }
        if !(mc.max_accel.is_finite() && mc.max_accel >= 0.0) {
            return Err(invalid(format!(
                "max_accel must be non-negative, got {}",
                mc.max_accel
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ControlState
// ─────────────────────────────────────────────────────────────────────────────

/// Which feedback signal a control state closes its loop on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackTags {
    pub uses_position_feedback: bool,
    pub uses_velocity_feedback: bool,
}

/// The active control mode of a servo mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    #[default]
    OpenLoop,
    /// Onboard motion-profiled position control.
    MotionMagic,
    VelocityPid,
    PositionPid,
}

/// Feedback tags indexed by [`ControlState`] discriminant.
const FEEDBACK_TAGS: [FeedbackTags; 4] = [
    // OpenLoop
    FeedbackTags {
        uses_position_feedback: false,
        uses_velocity_feedback: false,
    },
    // MotionMagic
    FeedbackTags {
        uses_position_feedback: false,
        uses_velocity_feedback: true,
    },
    // VelocityPid
    FeedbackTags {
        uses_position_feedback: false,
        uses_velocity_feedback: true,
    },
    // PositionPid
    FeedbackTags {
        uses_position_feedback: true,
        uses_velocity_feedback: false,
    },
];

impl ControlState {
    pub const ALL: [ControlState; 4] = [
        ControlState::OpenLoop,
        ControlState::MotionMagic,
        ControlState::VelocityPid,
        ControlState::PositionPid,
    ];

    pub const fn feedback(self) -> FeedbackTags {
        FEEDBACK_TAGS[self as usize]
    }

    pub const fn uses_position_feedback(self) -> bool {
        self.feedback().uses_position_feedback
    }

    pub const fn uses_velocity_feedback(self) -> bool {
        self.feedback().uses_velocity_feedback
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ControlState::OpenLoop => "OPEN_LOOP",
            ControlState::MotionMagic => "MOTION_MAGIC",
            ControlState::VelocityPid => "VELOCITY_PID",
            ControlState::PositionPid => "POSITION_PID",
        }
    }
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry
// ─────────────────────────────────────────────────────────────────────────────

/// A single sampled telemetry quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Number(f64),
    Text(String),
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        TelemetryValue::Number(value)
    }
}

impl From<String> for TelemetryValue {
    fn from(value: String) -> Self {
        TelemetryValue::Text(value)
    }
}

impl From<&str> for TelemetryValue {
    fn from(value: &str) -> Self {
        TelemetryValue::Text(value.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error taxonomy shared by every servoloop crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServoError {
    #[error("Invalid configuration for {mechanism}: {details}")]
    InvalidConfig { mechanism: String, details: String },

    #[error("Invalid setpoint for {mechanism}: {details}")]
    InvalidSetpoint { mechanism: String, details: String },

    #[error("Hardware Fault on {component}: {details}")]
    HardwareFault { component: String, details: String },

    #[error("Participant {participant} failed in {looper}: {details}")]
    ParticipantFault {
        looper: String,
        participant: String,
        details: String,
    },

    #[error("Looper {looper} no longer accepts registrations")]
    RegistrationClosed { looper: String },

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Telemetry Error: {0}")]
    Telemetry(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains(slot: u8) -> PidGains {
        PidGains {
            slot,
            kp: 0.5,
            ki: 0.0,
            kd: 0.1,
            kf: 0.05,
        }
    }

    fn config() -> MechanismConfig {
        MechanismConfig {
            name: "arm".to_string(),
            units_name: "degrees".to_string(),
            position_pid_gains: gains(1),
            velocity_pid_gains: gains(0),
            home_position: 0.0,
            motion_constraints: MotionConstraints {
                reverse_soft_limit: Some(-45.0),
                forward_soft_limit: Some(120.0),
                cruise_velocity: 100.0,
                max_accel: 200.0,
                curve_strength: 2,
            },
            ticks_per_unit_distance: 4096.0 / 360.0,
            brake_mode: false,
        }
    }

    #[test]
    fn feedback_table_matches_states() {
        assert!(!ControlState::OpenLoop.uses_position_feedback());
        assert!(!ControlState::OpenLoop.uses_velocity_feedback());
        assert!(ControlState::MotionMagic.uses_velocity_feedback());
        assert!(!ControlState::MotionMagic.uses_position_feedback());
        assert!(ControlState::VelocityPid.uses_velocity_feedback());
        assert!(ControlState::PositionPid.uses_position_feedback());
        assert!(!ControlState::PositionPid.uses_velocity_feedback());
    }

    #[test]
    fn no_state_uses_both_feedback_signals() {
        for state in ControlState::ALL {
            let tags = state.feedback();
            assert!(!(tags.uses_position_feedback && tags.uses_velocity_feedback));
        }
    }

    #[test]
    fn control_state_display_and_serde_agree() {
        for state in ControlState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        assert_eq!(ControlState::default(), ControlState::OpenLoop);
    }

    #[test]
    fn valid_config_passes() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn non_positive_ticks_per_unit_rejected() {
        let mut cfg = config();
        cfg.ticks_per_unit_distance = 0.0;
        assert!(matches!(
            cfg.validate(),
            Err(ServoError::InvalidConfig { .. })
        ));
        cfg.ticks_per_unit_distance = -3.0;
        assert!(cfg.validate().is_err());
        cfg.ticks_per_unit_distance = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_soft_limits_rejected() {
        let mut cfg = config();
        cfg.motion_constraints.reverse_soft_limit = Some(10.0);
        cfg.motion_constraints.forward_soft_limit = Some(-10.0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("arm"));
    }

    #[test]
    fn one_sided_and_equal_limits_are_valid() {
        let mut cfg = config();
        cfg.motion_constraints.forward_soft_limit = None;
        assert!(cfg.validate().is_ok());
        cfg.motion_constraints.forward_soft_limit = Some(-45.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_finite_limit_rejected() {
        let mut cfg = config();
        cfg.motion_constraints.reverse_soft_limit = Some(f64::NAN);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn negative_cruise_velocity_rejected() {
        let mut cfg = config();
        cfg.motion_constraints.cruise_velocity = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn clamp_position_respects_missing_limits() {
        let mut mc = config().motion_constraints;
        assert_eq!(mc.clamp_position(500.0), 120.0);
        assert_eq!(mc.clamp_position(-500.0), -45.0);
        mc.forward_soft_limit = None;
        assert_eq!(mc.clamp_position(1.0e12), 1.0e12);
        assert_eq!(mc.clamp_position(-500.0), -45.0);
    }

    #[test]
    fn clamp_velocity_is_symmetric() {
        let mc = config().motion_constraints;
        assert_eq!(mc.clamp_velocity(150.0), 100.0);
        assert_eq!(mc.clamp_velocity(-150.0), -100.0);
        assert_eq!(mc.clamp_velocity(42.0), 42.0);
    }

    #[test]
    fn config_deserializes_from_toml_without_limits() {
        let raw = r#"
            name = "turret"
            units_name = "degrees"
            ticks_per_unit_distance = 11.377
            position_pid_gains = { slot = 1, kp = 0.2, ki = 0.0, kd = 0.0, kf = 0.0 }
            velocity_pid_gains = { slot = 0, kp = 0.1, ki = 0.0, kd = 0.0, kf = 0.04 }

            [motion_constraints]
            cruise_velocity = 90.0
            max_accel = 180.0
        "#;
        let cfg: MechanismConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.motion_constraints.forward_soft_limit, None);
        assert_eq!(cfg.motion_constraints.curve_strength, 0);
        assert_eq!(cfg.home_position, 0.0);
        assert!(!cfg.brake_mode);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn telemetry_value_serializes_untagged() {
        assert_eq!(serde_json::to_string(&TelemetryValue::from(1.5)).unwrap(), "1.5");
        assert_eq!(
            serde_json::to_string(&TelemetryValue::from("OPEN_LOOP")).unwrap(),
            "\"OPEN_LOOP\""
        );
    }

    #[test]
    fn servo_error_display() {
        let err = ServoError::HardwareFault {
            component: "wrist".to_string(),
            details: "CAN timeout".to_string(),
        };
        assert!(err.to_string().contains("wrist"));

        let err = ServoError::RegistrationClosed {
            looper: "enabled".to_string(),
        };
        assert!(err.to_string().contains("enabled"));
    }
}
