use crate::imports::*;
use crate::track::{AxleFollower, TrackSample};
use crate::train::CarAirBrake;

/// One stage of a piecewise traction curve. Below `v1` the output blends
/// from `a0` to `a1`; between `v1` and `v2` it follows `v1 * a1 / v`; above
/// `v2` it falls off as `v^-e2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccelerationCurve {
    pub a0: si::Acceleration,
    pub a1: si::Acceleration,
    pub v1: si::Velocity,
    pub v2: si::Velocity,
    pub e2: f64,
}

impl Default for AccelerationCurve {
    fn default() -> Self {
        Self {
            a0: 1.0 * uc::MPS2,
            a1: 1.0 * uc::MPS2,
            v1: 15.0 * uc::MPS,
            v2: 25.0 * uc::MPS,
            e2: 2.0,
        }
    }
}

impl AccelerationCurve {
    /// Traction output at `speed`, scaled by `factor`.
    pub fn output(&self, speed: si::Velocity, factor: f64) -> si::Acceleration {
        if speed <= si::Velocity::ZERO {
            factor * self.a0
        } else if speed < self.v1 {
            let t = (speed / self.v1).get::<si::ratio>();
            factor * (self.a0 * (1.0 - t) + self.a1 * t)
        } else if speed < self.v2 {
            factor * self.a1 * (self.v1 / speed).get::<si::ratio>()
        } else {
            let v1 = self.v1.get::<si::meter_per_second>();
            let a1 = self.a1.get::<si::meter_per_second_squared>();
            let v2 = self.v2.get::<si::meter_per_second>();
            let v = speed.get::<si::meter_per_second>();
            factor * v1 * a1 * v2.powf(self.e2 - 1.0) * v.powf(-self.e2) * uc::MPS2
        }
    }
}

impl ObjState for AccelerationCurve {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_gez(&mut errors, &self.a0, "Stage 0 acceleration");
        si_chk_num_gez(&mut errors, &self.a1, "Stage 1 acceleration");
        si_chk_num_gtz(&mut errors, &self.v1, "Stage 1 speed");
        si_chk_num_gtz(&mut errors, &self.v2, "Stage 2 speed");
        chk_num_fin(&mut errors, self.e2, "Stage 2 exponent");
        if self.v2 < self.v1 {
            errors.push(anyhow!("Stage 2 speed must be >= stage 1 speed!"));
        }
        errors.make_err()
    }
}

/// Wheel-slip recovery device grade. Grades differ in how quickly the
/// output clamp is applied and released after a slip.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReAdhesionGrade {
    #[default]
    A,
    B,
    C,
    D,
}

/// Limits traction output after wheel slip and releases the limit stepwise
/// once the axles have been stable for a while.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReAdhesionDevice {
    pub update_interval: si::Time,
    pub application_factor: f64,
    pub release_interval: si::Time,
    pub release_factor: f64,
    #[serde(default)]
    pub next_update_time: si::Time,
    #[serde(default)]
    pub time_stable: si::Time,
    /// Current clamp on traction output. Infinite when fully released.
    #[serde(default = "unclamped")]
    pub max_acceleration_output: si::Acceleration,
}

fn unclamped() -> si::Acceleration {
    f64::INFINITY * uc::MPS2
}

impl Default for ReAdhesionDevice {
    fn default() -> Self {
        Self::new(ReAdhesionGrade::A)
    }
}

impl ReAdhesionDevice {
    pub fn new(grade: ReAdhesionGrade) -> Self {
        let (update_interval, application_factor, release_interval, release_factor) = match grade {
            ReAdhesionGrade::A => (1.0, 0.0, 1.0, 8.0),
            ReAdhesionGrade::B => (0.1, 0.9935, 4.0, 1.125),
            ReAdhesionGrade::C => (0.1, 0.965, 2.0, 1.5),
            ReAdhesionGrade::D => (0.05, 0.935, 0.3, 2.0),
        };
        Self {
            update_interval: update_interval * uc::S,
            application_factor,
            release_interval: release_interval * uc::S,
            release_factor,
            next_update_time: si::Time::ZERO,
            time_stable: si::Time::ZERO,
            max_acceleration_output: unclamped(),
        }
    }

    /// Advances the device state. `curve_output` is the unclamped traction
    /// demand and `slipping` whether any powered axle slipped this tick.
    pub fn update(&mut self, now: si::Time, curve_output: si::Acceleration, slipping: bool) {
        if now < self.next_update_time {
            return;
        }
        self.next_update_time = now + self.update_interval;
        if slipping {
            self.max_acceleration_output = curve_output * self.application_factor;
            self.time_stable = si::Time::ZERO;
        } else {
            self.time_stable += self.update_interval;
            if self.time_stable >= self.release_interval {
                self.time_stable -= self.release_interval;
                if self.release_factor != 0.0
                    && self.max_acceleration_output <= curve_output + 1.0 * uc::MPS2
                {
                    if self.max_acceleration_output < 0.025 * uc::MPS2 {
                        self.max_acceleration_output = 0.025 * uc::MPS2;
                    } else {
                        self.max_acceleration_output =
                            self.max_acceleration_output * self.release_factor;
                    }
                } else {
                    self.max_acceleration_output = unclamped();
                }
            }
        }
    }
}

/// Servo that trims traction toward zero net acceleration when the driver
/// engages constant-speed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstSpeedDevice {
    pub available: bool,
    pub update_interval: si::Time,
    #[serde(default)]
    pub next_update_time: si::Time,
    #[serde(default)]
    pub output: si::Acceleration,
}

impl Default for ConstSpeedDevice {
    fn default() -> Self {
        Self {
            available: false,
            update_interval: 0.5 * uc::S,
            next_update_time: si::Time::ZERO,
            output: si::Acceleration::ZERO,
        }
    }
}

/// Holds the train at rest on a grade with a small motor-brake output while
/// the hold-brake handle is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldBrakeDevice {
    pub available: bool,
    pub update_interval: si::Time,
    #[serde(default)]
    pub next_update_time: si::Time,
    #[serde(default)]
    pub output: si::Acceleration,
}

impl Default for HoldBrakeDevice {
    fn default() -> Self {
        Self {
            available: false,
            update_interval: 0.5 * uc::S,
            next_update_time: si::Time::ZERO,
            output: si::Acceleration::ZERO,
        }
    }
}

/// One of a car's two axle assemblies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Axle {
    pub follower: AxleFollower,
    /// Longitudinal offset from the car center. Positive toward the front.
    pub offset: si::Length,
    /// Whether this axle slipped during the last tick.
    #[serde(default)]
    pub slip: bool,
}

/// A single vehicle in a train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Car {
    // geometry
    pub length: si::Length,
    pub width: si::Length,
    pub height: si::Length,
    pub center_of_gravity_height: si::Length,
    pub exposed_frontal_area: si::Area,
    pub unexposed_frontal_area: si::Area,
    // masses
    pub mass_empty: si::Mass,
    pub mass_current: si::Mass,
    /// Cabin floor area used when converting a passenger ratio to mass.
    pub cabin_area: si::Area,
    // resistance and adhesion
    pub drag_coefficient: f64,
    pub rolling_resistance_coefficient: f64,
    pub coefficient_of_static_friction: f64,
    pub critical_toppling_angle: si::Angle,
    // traction
    pub is_motor_car: bool,
    pub acceleration_curves: Vec<AccelerationCurve>,
    pub acceleration_curve_multiplier: f64,
    /// Below this speed the brake control system is inactive.
    pub brake_control_speed: si::Velocity,
    pub motor_deceleration: si::Acceleration,
    pub re_adhesion: ReAdhesionDevice,
    pub const_speed: ConstSpeedDevice,
    pub hold_brake: HoldBrakeDevice,
    // acceleration ramp rates, applied per second of elapsed time
    pub jerk_power_up: si::Acceleration,
    pub jerk_power_down: si::Acceleration,
    pub jerk_brake_up: si::Acceleration,
    pub jerk_brake_down: si::Acceleration,
    // brakes
    pub air_brake: CarAirBrake,
    // axles
    pub front_axle: Axle,
    pub rear_axle: Axle,
    // dynamic state
    #[serde(default)]
    pub speed: si::Velocity,
    #[serde(default)]
    pub acceleration: si::Acceleration,
    /// Signed motor output. Positive is traction, negative is motor brake.
    #[serde(default)]
    pub motor_acceleration_output: si::Acceleration,
    #[serde(default)]
    pub perceived_speed: si::Velocity,
    #[serde(default)]
    pub perceived_travel_distance: si::Length,
    #[serde(default)]
    pub roll_due_to_topple: si::Angle,
    #[serde(default)]
    pub derailed: bool,
    #[serde(default)]
    pub topples: bool,
}

impl Default for Car {
    fn default() -> Self {
        Self {
            length: 20.0 * uc::M,
            width: 2.9 * uc::M,
            height: 3.6 * uc::M,
            center_of_gravity_height: 1.5 * uc::M,
            exposed_frontal_area: 0.65 * 2.9 * 3.6 * uc::M2,
            unexposed_frontal_area: 0.2 * 2.9 * 3.6 * uc::M2,
            mass_empty: 40.0 * uc::TON,
            mass_current: 40.0 * uc::TON,
            cabin_area: 50.0 * uc::M2,
            drag_coefficient: 1.1,
            rolling_resistance_coefficient: 0.0025,
            coefficient_of_static_friction: 0.35,
            critical_toppling_angle: 0.2 * uc::RAD,
            is_motor_car: false,
            acceleration_curves: Vec::new(),
            acceleration_curve_multiplier: 1.0,
            brake_control_speed: si::Velocity::ZERO,
            motor_deceleration: si::Acceleration::ZERO,
            re_adhesion: Default::default(),
            const_speed: Default::default(),
            hold_brake: Default::default(),
            jerk_power_up: 10.0 * uc::MPS2,
            jerk_power_down: 10.0 * uc::MPS2,
            jerk_brake_up: 10.0 * uc::MPS2,
            jerk_brake_down: 10.0 * uc::MPS2,
            air_brake: Default::default(),
            front_axle: Axle {
                offset: 8.0 * uc::M,
                ..Default::default()
            },
            rear_axle: Axle {
                offset: -8.0 * uc::M,
                ..Default::default()
            },
            speed: si::Velocity::ZERO,
            acceleration: si::Acceleration::ZERO,
            motor_acceleration_output: si::Acceleration::ZERO,
            perceived_speed: si::Velocity::ZERO,
            perceived_travel_distance: si::Length::ZERO,
            roll_due_to_topple: si::Angle::ZERO,
            derailed: false,
            topples: false,
        }
    }
}

impl Car {
    /// Track position of the car center.
    pub fn center_position(&self) -> si::Length {
        0.5 * ((self.front_axle.follower.track_position - self.front_axle.offset)
            + (self.rear_axle.follower.track_position - self.rear_axle.offset))
    }
    /// Track position of the leading face.
    pub fn front_position(&self) -> si::Length {
        self.front_axle.follower.track_position - self.front_axle.offset + 0.5 * self.length
    }
    /// Track position of the trailing face.
    pub fn rear_position(&self) -> si::Length {
        self.rear_axle.follower.track_position - self.rear_axle.offset - 0.5 * self.length
    }

    /// Traction output of the active curve stage at `speed`, or zero when
    /// `curve_index` is beyond the configured stages.
    pub fn acceleration_output(&self, curve_index: usize, speed: si::Velocity) -> si::Acceleration {
        match self.acceleration_curves.get(curve_index) {
            Some(curve) => curve.output(speed, self.acceleration_curve_multiplier),
            None => si::Acceleration::ZERO,
        }
    }

    /// Acceleration above which the given axle slips. Zero when derailed.
    pub fn critical_slip_acceleration(
        &self,
        sample: &TrackSample,
        gravity: si::Acceleration,
    ) -> si::Acceleration {
        if self.derailed {
            si::Acceleration::ZERO
        } else {
            self.coefficient_of_static_friction * sample.adhesion * sample.up_y * gravity
        }
    }
}

impl ObjState for Car {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_gtz(&mut errors, &self.length, "Length");
        si_chk_num_gtz(&mut errors, &self.width, "Width");
        si_chk_num_gtz(&mut errors, &self.height, "Height");
        si_chk_num_gtz(&mut errors, &self.mass_empty, "Empty mass");
        si_chk_num_gtz(&mut errors, &self.mass_current, "Current mass");
        si_chk_num_gez(&mut errors, &self.exposed_frontal_area, "Exposed frontal area");
        si_chk_num_gez(
            &mut errors,
            &self.unexposed_frontal_area,
            "Unexposed frontal area",
        );
        chk_num_gez(&mut errors, self.drag_coefficient, "Drag coefficient");
        chk_num_gez(
            &mut errors,
            self.rolling_resistance_coefficient,
            "Rolling resistance coefficient",
        );
        chk_num_gtz(
            &mut errors,
            self.coefficient_of_static_friction,
            "Coefficient of static friction",
        );
        si_chk_num_gez(&mut errors, &self.motor_deceleration, "Motor deceleration");
        if self.front_axle.offset <= self.rear_axle.offset {
            errors.push(anyhow!("Front axle offset must exceed rear axle offset!"));
        }
        if self.is_motor_car && self.acceleration_curves.is_empty() {
            errors.push(anyhow!("Motor car must have at least one traction curve!"));
        }
        for (idx, curve) in self.acceleration_curves.iter().enumerate() {
            validate_field_real(&mut errors, curve, &format!("Traction curve [{idx}]"));
        }
        if let Err(sub) = self.air_brake.validate() {
            errors.push(anyhow!("Air brake is invalid:\n{sub}"));
        }
        errors.make_err()
    }
}

impl Valid for Car {
    fn valid() -> Self {
        Self {
            is_motor_car: true,
            acceleration_curves: vec![AccelerationCurve::default()],
            motor_deceleration: 1.0 * uc::MPS2,
            ..Default::default()
        }
    }
}
