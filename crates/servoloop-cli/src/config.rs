//! Robot description – reads/writes `~/.servoloop/robot.toml`.
//!
//! ```toml
//! looper_dt = 0.02
//! run_seconds = 4.0
//! telemetry_path = "telemetry.jsonl"
//!
//! [[mechanisms]]
//! name = "arm"
//! units_name = "degrees"
//! ticks_per_unit_distance = 11.377777
//! ...
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use servoloop_types::{MechanismConfig, MotionConstraints, PidGains, ServoError};

/// Slowest accepted scheduler period, in seconds.
pub const MAX_LOOPER_DT: f64 = 1.0;
/// Longest accepted enabled phase, in seconds (one day).
pub const MAX_RUN_SECONDS: f64 = 86_400.0;

/// Everything the CLI needs to assemble and drive a simulated robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Scheduler period in seconds.
    #[serde(default = "default_looper_dt")]
    pub looper_dt: f64,

    /// How long the enabled phase runs before the CLI shuts down.
    #[serde(default = "default_run_seconds")]
    pub run_seconds: f64,

    /// Append one JSON line per telemetry frame to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_path: Option<PathBuf>,

    #[serde(default)]
    pub mechanisms: Vec<MechanismConfig>,
}

fn default_looper_dt() -> f64 {
    servoloop_runtime::LOOPER_DT
}

fn default_run_seconds() -> f64 {
    4.0
}

impl RobotConfig {
    /// Two-joint demo robot used when no description file exists.
    pub fn demo() -> Self {
        let velocity_gains = PidGains {
            slot: 0,
            kp: 0.1,
            ki: 0.0,
            kd: 0.0,
            kf: 0.045,
        };
        let position_gains = PidGains {
            slot: 1,
            kp: 0.6,
            ki: 0.0,
            kd: 6.0,
            kf: 0.0,
        };
        Self {
            looper_dt: default_looper_dt(),
            run_seconds: default_run_seconds(),
            telemetry_path: None,
            mechanisms: vec![
                MechanismConfig {
                    name: "arm".to_string(),
                    units_name: "degrees".to_string(),
                    position_pid_gains: position_gains,
                    velocity_pid_gains: velocity_gains,
                    home_position: -10.0,
                    motion_constraints: MotionConstraints {
                        reverse_soft_limit: Some(-10.0),
                        forward_soft_limit: Some(200.0),
                        cruise_velocity: 180.0,
                        max_accel: 360.0,
                        curve_strength: 2,
                    },
                    ticks_per_unit_distance: 2048.0 * 100.0 / 360.0,
                    brake_mode: true,
                },
                MechanismConfig {
                    name: "elevator".to_string(),
                    units_name: "inches".to_string(),
                    position_pid_gains: position_gains,
                    velocity_pid_gains: velocity_gains,
                    home_position: 0.0,
                    motion_constraints: MotionConstraints {
                        reverse_soft_limit: Some(0.0),
                        forward_soft_limit: None,
                        cruise_velocity: 60.0,
                        max_accel: 120.0,
                        curve_strength: 0,
                    },
                    ticks_per_unit_distance: 2048.0 * 12.0 / 5.5,
                    brake_mode: true,
                },
            ],
        }
    }

    /// Reject descriptions the runtime cannot drive: a period outside
    /// `(0, MAX_LOOPER_DT]`, a run length outside `[0, MAX_RUN_SECONDS]`,
    /// duplicate mechanism names, or any invalid mechanism.
    pub fn validate(&self) -> Result<(), ServoError> {
        if !(self.looper_dt > 0.0 && self.looper_dt <= MAX_LOOPER_DT) {
            return Err(ServoError::Config(format!(
                "looper_dt must be in (0, {MAX_LOOPER_DT}] seconds, got {}",
                self.looper_dt
            )));
        }
        if !(self.run_seconds >= 0.0 && self.run_seconds <= MAX_RUN_SECONDS) {
            return Err(ServoError::Config(format!(
                "run_seconds must be in [0, {MAX_RUN_SECONDS}], got {}",
                self.run_seconds
            )));
        }
        let mut seen = HashSet::new();
        for mechanism in &self.mechanisms {
            if !seen.insert(mechanism.name.as_str()) {
                return Err(ServoError::Config(format!(
                    "duplicate mechanism name {:?}",
                    mechanism.name
                )));
            }
            mechanism.validate()?;
        }
        Ok(())
    }

    /// Scheduler period as a [`Duration`].
    pub fn period(&self) -> Result<Duration, ServoError> {
        seconds("looper_dt", self.looper_dt)
    }

    /// Length of the enabled phase as a [`Duration`].
    pub fn run_duration(&self) -> Result<Duration, ServoError> {
        seconds("run_seconds", self.run_seconds)
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ServoError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| ServoError::Config(format!("{field} = {value} is not a valid duration: {e}")))
}

/// Return the path to `~/.servoloop/robot.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".servoloop").join("robot.toml")
}

/// Description file to use: the explicit argument, else `SERVOLOOP_CONFIG`,
/// else [`config_path`].
pub fn resolve_path(arg: Option<&str>) -> PathBuf {
    arg.map(PathBuf::from)
        .or_else(|| std::env::var_os("SERVOLOOP_CONFIG").map(PathBuf::from))
        .unwrap_or_else(config_path)
}

/// Load the description at `path`.  Returns `None` if the file does not
/// exist.
pub fn load_from(path: &Path) -> Result<Option<RobotConfig>, ServoError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        ServoError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let mut cfg: RobotConfig = toml::from_str(&raw).map_err(|e| {
        ServoError::Config(format!("failed to parse {}: {e}", path.display()))
    })?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(Some(cfg))
}

/// Apply `SERVOLOOP_*` overrides looked up through `var`.
///
/// | Variable | Field |
/// |---|---|
/// | `SERVOLOOP_LOOPER_DT` | `looper_dt` |
/// | `SERVOLOOP_RUN_SECONDS` | `run_seconds` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut RobotConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SERVOLOOP_LOOPER_DT")
        && let Ok(dt) = v.trim().parse::<f64>()
    {
        cfg.looper_dt = dt;
    }
    if let Some(v) = var("SERVOLOOP_RUN_SECONDS")
        && let Ok(secs) = v.trim().parse::<f64>()
    {
        cfg.run_seconds = secs;
    }
}

/// Write `cfg` to `path`, creating parent directories as needed.
pub fn save_to(cfg: &RobotConfig, path: &Path) -> Result<(), ServoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            ServoError::Config(format!("failed to create {}: {e}", parent.display()))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| ServoError::Config(format!("failed to serialise robot description: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| ServoError::Config(format!("failed to write {}: {e}", path.display())))
}
