//! Tick ↔ physical-unit conversion.
//!
//! Encoders report integer ticks and velocities in ticks per 100 ms; control
//! code works in physical units (degrees, meters, ...) and units per second.
//! Conversions into tick space round half away from zero.

/// Stateless converter for one mechanism.
///
/// # Example
///
/// ```rust
/// use servoloop_mechanism::units::UnitConverter;
///
/// // 4096-count encoder on a joint measured in degrees, homed at 10°.
/// let units = UnitConverter::new(4096.0 / 360.0, 10.0);
///
/// assert_eq!(units.home_aware_units_to_ticks(80.0), 1024);
/// assert!((units.ticks_to_homed_units(1024) - 80.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitConverter {
    ticks_per_unit_distance: f64,
    home_position: f64,
}

impl UnitConverter {
    pub fn new(ticks_per_unit_distance: f64, home_position: f64) -> Self {
        Self {
            ticks_per_unit_distance,
            home_position,
        }
    }

    pub fn ticks_per_unit_distance(&self) -> f64 {
        self.ticks_per_unit_distance
    }

    pub fn home_position(&self) -> f64 {
        self.home_position
    }

    pub fn ticks_to_units(&self, ticks: i32) -> f64 {
        f64::from(ticks) / self.ticks_per_unit_distance
    }

    /// Raw ticks to position relative to the home offset.
    pub fn ticks_to_homed_units(&self, ticks: i32) -> f64 {
        self.ticks_to_units(ticks) - self.home_position
    }

    /// Saturates at the `i32` range.
    pub fn units_to_ticks(&self, units: f64) -> i32 {
        (units * self.ticks_per_unit_distance).round() as i32
    }

    /// Inverse of [`ticks_to_homed_units`](Self::ticks_to_homed_units).
    pub fn home_aware_units_to_ticks(&self, units: f64) -> i32 {
        self.units_to_ticks(units + self.home_position)
    }

    pub fn ticks_per_100ms_to_units_per_second(&self, ticks_per_100ms: i32) -> f64 {
        self.ticks_to_units(ticks_per_100ms) * 10.0
    }

    /// Rounds to whole ticks first, then to whole ticks per 100 ms.
    pub fn units_per_second_to_ticks_per_100ms(&self, units_per_second: f64) -> i32 {
        (f64::from(self.units_to_ticks(units_per_second)) / 10.0).round() as i32
    }
}
