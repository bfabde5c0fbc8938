//! `servoloop-cli` – simulated robot runner
//!
//! This binary assembles a robot from a TOML description and drives it
//! through the robot phases against simulated motor controllers:
//!
//! 1. Loads the description from the path in the first argument, else
//!    `SERVOLOOP_CONFIG`, else `~/.servoloop/robot.toml`, falling back to a
//!    built-in two-joint demo.  `servoloop --init` writes that demo to
//!    `~/.servoloop/robot.toml`.
//! 2. Builds one [`ServoMotorSubsystem`] per mechanism on a [`SimDriver`]
//!    wrapped in a [`LazyDriver`].
//! 3. Runs the disabled phase briefly, then the enabled phase with a scripted
//!    sequence of setpoints for `run_seconds`.
//! 4. Intercepts **Ctrl-C** to stop early and leave every mechanism in open
//!    loop at zero output.

mod config;

use std::fs::File;
use std::io::BufWriter;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use colored::Colorize;
use servoloop_hal::{LazyDriver, SimDriver};
use servoloop_mechanism::{ServoMotorSubsystem, TelemetryLog};
use servoloop_runtime::{Robot, SubsystemManager, init_tracing};
use servoloop_types::ServoError;
use tracing::{error, info, warn};

use crate::config::RobotConfig;

type SimServo = ServoMotorSubsystem<LazyDriver<SimDriver>>;

/// How long the disabled phase runs before the robot is enabled.
const DISABLED_WARMUP: Duration = Duration::from_millis(500);
/// Interval between scripted setpoint updates.
const COMMAND_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    let _guard = init_tracing("servoloop");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – disabling robot …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the run can only end on its timer");
    }

    let arg = std::env::args().nth(1);
    if arg.as_deref() == Some("--init") {
        return write_demo_config();
    }

    // ── Robot description ─────────────────────────────────────────────────
    let path = config::resolve_path(arg.as_deref());
    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            println!("  Robot loaded from {}", path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            println!(
                "  No robot description at {} – using the built-in demo.",
                path.display().to_string().dimmed()
            );
            let mut demo = RobotConfig::demo();
            config::apply_env_overrides(&mut demo, |key| std::env::var(key).ok());
            demo
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    match run(&cfg, &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "robot run failed");
            println!("{}: {}", "Robot fault".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Robot run
// ─────────────────────────────────────────────────────────────────────────────

struct SimMechanism {
    servo: Arc<SimServo>,
    driver: SimDriver,
}

fn run(cfg: &RobotConfig, shutdown: &AtomicBool) -> Result<(), ServoError> {
    cfg.validate()?;

    let mut manager = SubsystemManager::with_telemetry(telemetry_log(cfg)?);
    let mut mechanisms = Vec::with_capacity(cfg.mechanisms.len());
    for mechanism in &cfg.mechanisms {
        let driver = SimDriver::new(format!("{}_controller", mechanism.name));
        let servo = Arc::new(ServoMotorSubsystem::new(
            mechanism.clone(),
            LazyDriver::new(driver.clone()),
        )?);
        manager.register(servo.clone());
        mechanisms.push(SimMechanism { servo, driver });
    }

    let mut robot = Robot::with_period(manager, cfg.period()?);
    robot.robot_init()?;
    robot.disabled_init()?;
    println!("  {} disabled", "●".yellow());
    wait(DISABLED_WARMUP, shutdown);

    robot.teleop_init()?;
    println!("  {} enabled for {:.1}s", "●".green(), cfg.run_seconds);

    let run_for = cfg.run_duration()?;
    let started = Instant::now();
    while started.elapsed() < run_for && !shutdown.load(Ordering::SeqCst) {
        let progress = started.elapsed().as_secs_f64() / run_for.as_secs_f64();
        for mechanism in &mechanisms {
            command(mechanism, progress)?;
        }
        robot.poll_faults()?;
        thread::sleep(COMMAND_INTERVAL);
    }

    robot.disabled_init()?;
    robot.shutdown()?;
    print_summary(&robot, &mechanisms);
    Ok(())
}

fn telemetry_log(cfg: &RobotConfig) -> Result<TelemetryLog, ServoError> {
    let Some(path) = &cfg.telemetry_path else {
        return Ok(TelemetryLog::new());
    };
    let file = File::create(path)
        .map_err(|e| ServoError::Config(format!("failed to create {}: {e}", path.display())))?;
    info!(path = %path.display(), "writing telemetry frames");
    Ok(TelemetryLog::new().with_writer(Box::new(BufWriter::new(file))))
}

/// Scripted demo: profiled move to mid-travel, hold home with position PID,
/// cruise at half speed, then coast in open loop.  Velocity-feedback modes
/// do not replace each other, so position PID sits between the profiled move
/// and the cruise.  With no physics in the simulator, the encoder is moved
/// straight to each position target.
fn command(mechanism: &SimMechanism, progress: f64) -> Result<(), ServoError> {
    let servo = &mechanism.servo;
    let limits = servo.config().motion_constraints;
    match progress {
        p if p < 0.25 => {
            let reverse = limits.reverse_soft_limit.unwrap_or(0.0);
            let forward = limits.forward_soft_limit.unwrap_or(reverse + 90.0);
            let target = (reverse + forward) / 2.0;
            servo.set_position_setpoint_motion_profile(target)?;
            move_encoder(mechanism, target);
        }
        p if p < 0.5 => {
            servo.set_position_setpoint_position_pid(0.0)?;
            move_encoder(mechanism, 0.0);
        }
        p if p < 0.75 => servo.set_velocity_setpoint(limits.cruise_velocity / 2.0)?,
        _ => servo.set_open_loop_power(0.2),
    }
    Ok(())
}

fn move_encoder(mechanism: &SimMechanism, units: f64) {
    let ticks = mechanism.servo.units().home_aware_units_to_ticks(units);
    mechanism.driver.set_position_ticks(ticks);
}

fn wait(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
        thread::sleep(COMMAND_INTERVAL.min(duration));
    }
}

fn write_demo_config() -> ExitCode {
    let path = config::config_path();
    match config::save_to(&RobotConfig::demo(), &path) {
        Ok(()) => {
            println!(
                "\n  {} Demo robot written to {}\n",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {}", "Error saving robot description".red(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_summary(robot: &Robot, mechanisms: &[SimMechanism]) {
    println!();
    println!("  {}", "Run summary".bold());
    for mechanism in mechanisms {
        let servo = &mechanism.servo;
        let suppressed = servo.with_hardware(|hw| hw.suppressed_writes());
        let writes = mechanism.driver.setpoint_commands().len();
        let position = servo
            .position()
            .map(|p| format!("{p:.2}"))
            .unwrap_or_else(|_| "?".to_string());
        println!(
            "    • {:<10} {} {:<8} {} writes ({} suppressed)  final {} {}",
            servo.config().name.bold(),
            "state".dimmed(),
            servo.control_state().to_string(),
            writes,
            suppressed,
            position,
            servo.config().units_name,
        );
    }

    for (phase, detector) in [
        ("enabled", robot.enabled_overruns()),
        ("disabled", robot.disabled_overruns()),
    ] {
        let timing = detector.stats();
        println!(
            "    • {:<8} {} ticks, {} overruns, worst dT {:.1} ms",
            phase,
            timing.ticks,
            timing.overruns,
            timing.worst_dt * 1000.0
        );
    }
    let frames = robot.manager().telemetry();
    let frames = frames.lock().map(|log| log.frames_saved()).unwrap_or(0);
    println!("    • {frames} telemetry frames");
    println!();
}

fn print_banner() {
    println!();
    println!("{}", r#"   ____                   __                "#.bold().cyan());
    println!("{}", r#"  / __/__ _____  _____  / /  ___  ___  ___  "#.bold().cyan());
    println!("{}", r#" _\ \/ -_) __/ |/ / _ \/ /__/ _ \/ _ \/ _ \ "#.bold().cyan());
    println!("{}", r#"/___/\__/_/  |___/\___/____/\___/\___/ .__/ "#.bold().cyan());
    println!("{}", r#"                                    /_/     "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "servoloop".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Fixed-rate servo mechanism control");
    println!();
}
