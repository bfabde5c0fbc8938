//! [`Robot`] – phase switcher owning the enabled and disabled loopers.
//!
//! Exactly one looper runs at a time.  Every enabled phase (autonomous,
//! teleop, test) stops the disabled looper and starts the enabled one;
//! entering the disabled phase does the reverse.  Failures in any phase
//! transition, or a fault that halted a running looper, are logged with full
//! context at `error!` before being returned to the caller, who decides
//! whether to crash.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use servoloop_types::ServoError;
use tracing::{error, info};

use crate::looper::{LOOPER_DT, Looper};
use crate::manager::SubsystemManager;
use crate::overrun::OverrunDetector;

pub const ENABLED_DT_LABEL: &str = "Enabled Looper dT";
pub const DISABLED_DT_LABEL: &str = "Disabled Looper dT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotPhase {
    Constructed,
    Disabled,
    Autonomous,
    Teleop,
    Test,
    Shutdown,
}

impl RobotPhase {
    pub fn is_enabled(self) -> bool {
        matches!(
            self,
            RobotPhase::Autonomous | RobotPhase::Teleop | RobotPhase::Test
        )
    }
}

impl fmt::Display for RobotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RobotPhase::Constructed => "constructed",
            RobotPhase::Disabled => "disabled",
            RobotPhase::Autonomous => "autonomous",
            RobotPhase::Teleop => "teleop",
            RobotPhase::Test => "test",
            RobotPhase::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

pub struct Robot {
    manager: SubsystemManager,
    enabled: Looper,
    disabled: Looper,
    enabled_overruns: Arc<OverrunDetector>,
    disabled_overruns: Arc<OverrunDetector>,
    phase: RobotPhase,
    initialized: bool,
}

impl Robot {
    /// Robot ticking at the nominal [`LOOPER_DT`].
    pub fn new(manager: SubsystemManager) -> Self {
        Self::with_period(manager, Duration::from_secs_f64(LOOPER_DT))
    }

    pub fn with_period(manager: SubsystemManager, period: Duration) -> Self {
        Self {
            manager,
            enabled: Looper::new("enabled", period),
            disabled: Looper::new("disabled", period),
            enabled_overruns: Arc::new(OverrunDetector::new("enabled overruns", period)),
            disabled_overruns: Arc::new(OverrunDetector::new("disabled overruns", period)),
            phase: RobotPhase::Constructed,
            initialized: false,
        }
    }

    pub fn phase(&self) -> RobotPhase {
        self.phase
    }

    pub fn manager(&self) -> &SubsystemManager {
        &self.manager
    }

    pub fn enabled_looper(&self) -> &Looper {
        &self.enabled
    }

    pub fn disabled_looper(&self) -> &Looper {
        &self.disabled
    }

    /// Timing monitor of the enabled looper.  Totals cover the current or
    /// most recent enabled phase.
    pub fn enabled_overruns(&self) -> &OverrunDetector {
        &self.enabled_overruns
    }

    /// Timing monitor of the disabled looper.
    pub fn disabled_overruns(&self) -> &OverrunDetector {
        &self.disabled_overruns
    }

    /// Self-test every subsystem, then wire them into both loopers and
    /// publish looper timing telemetry.  Runs once; later calls are no-ops.
    pub fn robot_init(&mut self) -> Result<(), ServoError> {
        if self.initialized {
            return Ok(());
        }
        let result = self.wire();
        self.initialized = result.is_ok();
        crash_tracked("robot_init", result)
    }

    fn wire(&mut self) -> Result<(), ServoError> {
        self.manager.check_system()?;

        self.enabled.register(self.manager.enabled_loop())?;
        self.enabled.register(self.enabled_overruns.clone())?;
        self.disabled.register(self.manager.disabled_loop())?;
        self.disabled.register(self.disabled_overruns.clone())?;

        self.manager
            .add_source(ENABLED_DT_LABEL, self.enabled.dt_supplier());
        self.manager
            .add_source(DISABLED_DT_LABEL, self.disabled.dt_supplier());
        info!(
            subsystems = self.manager.subsystems().len(),
            "robot initialised"
        );
        Ok(())
    }

    pub fn disabled_init(&mut self) -> Result<(), ServoError> {
        let result = self.switch(RobotPhase::Disabled);
        crash_tracked("disabled_init", result)
    }

    pub fn autonomous_init(&mut self) -> Result<(), ServoError> {
        let result = self.switch(RobotPhase::Autonomous);
        crash_tracked("autonomous_init", result)
    }

    pub fn teleop_init(&mut self) -> Result<(), ServoError> {
        let result = self.switch(RobotPhase::Teleop);
        crash_tracked("teleop_init", result)
    }

    pub fn test_init(&mut self) -> Result<(), ServoError> {
        let result = self.switch(RobotPhase::Test);
        crash_tracked("test_init", result)
    }

    /// Stop both loopers.  Both are stopped even if the first fails.
    pub fn shutdown(&mut self) -> Result<(), ServoError> {
        let enabled = self.enabled.stop();
        let disabled = self.disabled.stop();
        self.phase = RobotPhase::Shutdown;
        info!("robot shut down");
        crash_tracked("shutdown", enabled.and(disabled))
    }

    /// Surface a fault that halted a running looper since the last poll.
    pub fn poll_faults(&self) -> Result<(), ServoError> {
        let fault = self.enabled.take_fault().or_else(|| self.disabled.take_fault());
        match fault {
            Some(fault) => crash_tracked("periodic", Err(fault)),
            None => Ok(()),
        }
    }

    fn switch(&mut self, phase: RobotPhase) -> Result<(), ServoError> {
        if !self.initialized {
            self.robot_init()?;
        }
        if phase.is_enabled() {
            self.disabled.stop()?;
            self.enabled.start()?;
        } else {
            self.enabled.stop()?;
            self.disabled.start()?;
        }
        info!(from = %self.phase, to = %phase, "robot phase change");
        self.phase = phase;
        Ok(())
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        if self.phase != RobotPhase::Shutdown {
            let _ = self.shutdown();
        }
    }
}

fn crash_tracked(phase: &str, result: Result<(), ServoError>) -> Result<(), ServoError> {
    if let Err(e) = &result {
        error!(%phase, error = %e, "robot phase failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use servoloop_hal::{DriverCommand, SimDriver};
    use servoloop_mechanism::ServoMotorSubsystem;
    use servoloop_types::{
        ControlState, MechanismConfig, MotionConstraints, PidGains, TelemetryValue,
    };
    use std::thread;

    fn arm_config() -> MechanismConfig {
        let gains = PidGains {
            slot: 0,
            kp: 0.2,
            ki: 0.0,
            kd: 0.0,
            kf: 0.04,
        };
        MechanismConfig {
            name: "arm".to_string(),
            units_name: "degrees".to_string(),
            position_pid_gains: PidGains { slot: 1, ..gains },
            velocity_pid_gains: gains,
            home_position: 0.0,
            motion_constraints: MotionConstraints {
                reverse_soft_limit: Some(0.0),
                forward_soft_limit: Some(180.0),
                cruise_velocity: 90.0,
                max_accel: 180.0,
                curve_strength: 0,
            },
            ticks_per_unit_distance: 4096.0 / 360.0,
            brake_mode: true,
        }
    }

    fn robot() -> (Robot, Arc<ServoMotorSubsystem<SimDriver>>, SimDriver) {
        let controller = SimDriver::new("arm_talon");
        let arm = Arc::new(ServoMotorSubsystem::new(arm_config(), controller.clone()).unwrap());
        let mut manager = SubsystemManager::new();
        manager.register(arm.clone());
        let robot = Robot::with_period(manager, Duration::from_millis(5));
        (robot, arm, controller)
    }

    #[test]
    fn only_one_looper_runs_per_phase() {
        let (mut robot, _, _) = robot();
        robot.robot_init().unwrap();

        robot.disabled_init().unwrap();
        assert!(robot.disabled_looper().is_running());
        assert!(!robot.enabled_looper().is_running());

        robot.teleop_init().unwrap();
        assert_eq!(robot.phase(), RobotPhase::Teleop);
        assert!(robot.enabled_looper().is_running());
        assert!(!robot.disabled_looper().is_running());

        robot.autonomous_init().unwrap();
        assert!(robot.enabled_looper().is_running());

        robot.shutdown().unwrap();
        assert!(!robot.enabled_looper().is_running());
        assert!(!robot.disabled_looper().is_running());
    }

    #[test]
    fn robot_init_runs_once() {
        let (mut robot, _, _) = robot();
        robot.robot_init().unwrap();
        robot.robot_init().unwrap();
        assert_eq!(robot.enabled_looper().participant_count(), 2);
        assert_eq!(robot.disabled_looper().participant_count(), 2);
    }

    #[test]
    fn both_phases_are_timing_monitored() {
        let (mut robot, _, _) = robot();
        robot.disabled_init().unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(robot.disabled_overruns().stats().ticks > 0);
        assert_eq!(robot.enabled_overruns().stats().ticks, 0);

        robot.teleop_init().unwrap();
        thread::sleep(Duration::from_millis(40));
        robot.shutdown().unwrap();

        assert!(robot.enabled_overruns().stats().ticks > 0);
        assert!(robot.disabled_overruns().stats().ticks > 0);
    }

    #[test]
    fn teleop_actuates_and_disabled_does_not() {
        let (mut robot, arm, controller) = robot();
        robot.disabled_init().unwrap();
        controller.take_commands();
        thread::sleep(Duration::from_millis(40));
        assert!(controller.setpoint_commands().is_empty());

        robot.teleop_init().unwrap();
        arm.set_velocity_setpoint(500.0).unwrap();
        thread::sleep(Duration::from_millis(60));
        robot.disabled_init().unwrap();

        assert!(controller.setpoint_commands().contains(&DriverCommand::Velocity(90.0)));
        assert_eq!(arm.control_state(), ControlState::OpenLoop);
    }

    #[test]
    fn looper_dt_is_published() {
        let (mut robot, _, _) = robot();
        robot.teleop_init().unwrap();
        thread::sleep(Duration::from_millis(60));
        robot.shutdown().unwrap();

        let log = robot.manager().telemetry();
        let log = log.lock().unwrap();
        let labels = log.labels();
        assert!(labels.contains(&ENABLED_DT_LABEL));
        assert!(labels.contains(&DISABLED_DT_LABEL));
        match log.value(ENABLED_DT_LABEL) {
            Some(TelemetryValue::Number(dt)) => assert!(dt > 0.0),
            other => panic!("unexpected dt sample {other:?}"),
        }
        assert!(log.value("arm State").is_some());
    }

    #[test]
    fn hardware_fault_surfaces_through_poll() {
        let (mut robot, arm, controller) = robot();
        robot.teleop_init().unwrap();
        arm.set_open_loop_power(0.3);
        controller.inject_fault("CAN frame lost");
        thread::sleep(Duration::from_millis(60));

        match robot.poll_faults() {
            Err(ServoError::ParticipantFault {
                looper, details, ..
            }) => {
                assert_eq!(looper, "enabled");
                assert!(details.contains("CAN frame lost"));
            }
            other => panic!("unexpected poll result {other:?}"),
        }
        assert!(robot.poll_faults().is_ok());
        robot.shutdown().unwrap();
    }

    #[test]
    fn failed_self_test_aborts_init() {
        use servoloop_mechanism::{Subsystem, TelemetrySink};

        struct Dead;
        impl Subsystem for Dead {
            fn name(&self) -> &str {
                "dead"
            }
            fn register_logging(self: Arc<Self>, _sink: &mut dyn TelemetrySink) {}
            fn check_system(&self) -> Result<(), ServoError> {
                Err(ServoError::HardwareFault {
                    component: "dead".to_string(),
                    details: "no response".to_string(),
                })
            }
            fn zero_sensors(&self) -> Result<(), ServoError> {
                Ok(())
            }
            fn on_start(&self, _t: f64) -> Result<(), ServoError> {
                Ok(())
            }
            fn on_loop(&self, _t: f64, _dt: f64) -> Result<(), ServoError> {
                Ok(())
            }
            fn on_stop(&self, _t: f64) -> Result<(), ServoError> {
                Ok(())
            }
        }

        let mut manager = SubsystemManager::new();
        manager.register(Arc::new(Dead));
        let mut robot = Robot::with_period(manager, Duration::from_millis(5));
        assert!(robot.robot_init().is_err());
        assert!(robot.teleop_init().is_err());
        assert!(!robot.enabled_looper().is_running());
    }
}
