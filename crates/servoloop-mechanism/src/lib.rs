//! `servoloop-mechanism` – Mechanism Control
//!
//! Closed-loop control of single physical mechanisms (arm joints, turrets,
//! swerve-module steering) on top of a
//! [`HardwareDriver`][servoloop_hal::HardwareDriver].
//!
//! # Modules
//!
//! - [`units`] – [`UnitConverter`][units::UnitConverter]: pure tick ↔
//!   physical-unit conversions with a home offset.
//! - [`subsystem`] – [`Subsystem`][subsystem::Subsystem]: the contract every
//!   mechanism fulfils so a scheduler can start, tick, and stop it.
//! - [`servo`] – [`ServoMotorSubsystem`][servo::ServoMotorSubsystem]: the
//!   four-mode control state machine with soft-limit clamping and PID slot
//!   switching.
//! - [`telemetry`] – [`TelemetrySink`][telemetry::TelemetrySink] and the
//!   in-process [`TelemetryLog`][telemetry::TelemetryLog] that samples
//!   registered sources once per control period.

pub mod servo;
pub mod subsystem;
pub mod telemetry;
pub mod units;

pub use servo::{ServoMotorSubsystem, ServoSetpoints};
pub use subsystem::Subsystem;
pub use telemetry::{TelemetryFrame, TelemetryLog, TelemetrySink, TelemetrySupplier};
pub use units::UnitConverter;
