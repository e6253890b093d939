//! Unit constants for multiplication-syntax quantity construction, e.g.
//! `200.0 * uc::M` or `5.0 * uc::KPA`.

use crate::si;

macro_rules! unit_const {
    ($(#[$meta:meta])* $name:ident, $T:ty, $value:expr) => {
        $(#[$meta])*
        pub const $name: $T = uom::si::Quantity {
            dimension: uom::lib::marker::PhantomData,
            units: uom::lib::marker::PhantomData,
            value: $value,
        };
    };
}

unit_const!(/// meter
    M, si::Length, 1.0);
unit_const!(/// kilometer
    KM, si::Length, 1.0e3);
unit_const!(/// second
    S, si::Time, 1.0);
unit_const!(/// hour
    HR, si::Time, 3600.0);
unit_const!(/// meter per second
    MPS, si::Velocity, 1.0);
unit_const!(/// kilometer per hour
    KPH, si::Velocity, 1.0 / 3.6);
unit_const!(/// meter per second squared
    MPS2, si::Acceleration, 1.0);
unit_const!(/// kilogram
    KG, si::Mass, 1.0);
unit_const!(/// metric ton
    TON, si::Mass, 1.0e3);
unit_const!(/// newton
    N, si::Force, 1.0);
unit_const!(/// pascal
    PA, si::Pressure, 1.0);
unit_const!(/// kilopascal
    KPA, si::Pressure, 1.0e3);
unit_const!(/// radian
    RAD, si::Angle, 1.0);
unit_const!(/// unitless ratio
    R, si::Ratio, 1.0);
unit_const!(/// square meter
    M2, si::Area, 1.0);
unit_const!(/// kilogram per cubic meter
    KGPM3, si::MassDensity, 1.0);

unit_const!(/// standard gravitational acceleration
    ACC_GRAV, si::Acceleration, 9.80665);

/// Sea-level air density used for aerodynamic drag.
pub fn rho_air() -> si::MassDensity {
    1.225 * KGPM3
}
