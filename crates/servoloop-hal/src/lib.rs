//! `servoloop-hal` – Hardware Abstraction Layer
//!
//! The capability boundary between mechanism control logic and a concrete
//! motor-controller chip.  Control code only ever talks to the
//! [`HardwareDriver`] trait, so vendor drivers can be swapped without touching
//! the servo state machine.
//!
//! # Modules
//!
//! - [`driver`] – [`HardwareDriver`][driver::HardwareDriver]: sensor reads,
//!   setpoint writes, gain/constraint configuration, and the active PID slot.
//! - [`lazy`] – [`LazyDriver`][lazy::LazyDriver]: wraps any driver and drops
//!   setpoint writes that repeat the previous (mode, value) pair.
//! - [`sim`] – [`SimDriver`][sim::SimDriver]: an in-process stub that records
//!   every command so the full stack runs headless in tests and CI.

pub mod driver;
pub mod lazy;
pub mod sim;

pub use driver::{DriverConstraints, HardwareDriver};
pub use lazy::{ControlMode, LazyDriver};
pub use sim::{DriverCommand, SimDriver};
