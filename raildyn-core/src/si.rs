//! Import uom si system and add unit constants
//! Zero values should be created using standard uom syntax ($Quantity::ZERO) after adding "use crate::imports::*"
//! Non-zero values should be created using standard uom syntax ($Quantity::new::<$unit>($value)) or multiplication syntax ($value * $UNIT_CONSTANT)

use uom::si;

pub use si::acceleration::meter_per_second_squared;
pub use si::angle::{degree, radian};
pub use si::area::square_meter;
pub use si::f64::{
    Acceleration, Angle, Area, Force, Frequency, Length, Mass, MassDensity, Power, Pressure,
    Ratio, TemperatureInterval, ThermodynamicTemperature, Time, Velocity, Volume,
};
pub use si::force::newton;
pub use si::length::{kilometer, meter};
pub use si::mass::{kilogram, megagram};
pub use si::mass_density::kilogram_per_cubic_meter;
pub use si::pressure::{kilopascal, pascal};
pub use si::ratio::{percent, ratio};
pub use si::time::{hour, second};
pub use si::velocity::{kilometer_per_hour, meter_per_second};
