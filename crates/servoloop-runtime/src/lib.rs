//! `servoloop-runtime` – Scheduling and Composition
//!
//! Drives mechanisms at a fixed rate and switches between the enabled and
//! disabled robot phases.
//!
//! # Modules
//!
//! - [`looper`] – [`Looper`][looper::Looper]: a fixed-period scheduler
//!   thread calling [`Loop`][looper::Loop] participants in registration
//!   order with the measured `dt`.
//! - [`manager`] – [`SubsystemManager`][manager::SubsystemManager]: the
//!   ordered mechanism registry and its enabled/disabled composite loops.
//! - [`overrun`] – [`OverrunDetector`][overrun::OverrunDetector]: a loop
//!   participant counting ticks that ran past the nominal period.
//! - [`robot`] – [`Robot`][robot::Robot]: owns both loopers, keeps exactly
//!   one running per phase, and logs every failure before returning it.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: installs the
//!   global `tracing` subscriber with an optional OTLP span exporter.

pub mod looper;
pub mod manager;
pub mod overrun;
pub mod robot;
pub mod telemetry;

pub use looper::{LOOPER_DT, Loop, Looper};
pub use manager::SubsystemManager;
pub use overrun::{OverrunDetector, OverrunStats};
pub use robot::{Robot, RobotPhase};
pub use telemetry::{TracerProviderGuard, init_tracing};
