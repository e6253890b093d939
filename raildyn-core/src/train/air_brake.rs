//! Per-car air brake pneumatics. Reservoir-to-reservoir transfers use a
//! nonlinear rate that slows as the pressure difference closes, and every
//! transfer splits momentum between source and sink so repeated updates
//! converge without oscillating.

use crate::imports::*;
use crate::train::{AirBrakeHandleState, Car, TrainHandles};

/// Deadband below which reservoirs are considered equalized.
pub const PRESSURE_TOLERANCE: si::Pressure = si::Pressure {
    dimension: uom::lib::marker::PhantomData,
    units: uom::lib::marker::PhantomData,
    value: 5000.0,
};

/// How the brake command reaches the cylinder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrakeType {
    /// Triple valve driven by brake pipe pressure alone.
    AutomaticAirBrake,
    /// Straight air with an electric assist solenoid per car.
    ElectromagneticStraightAirBrake,
    /// Cylinder follows the notch command directly from the main reservoir.
    #[default]
    ElectricCommandBrake,
}

/// Electropneumatic blending fitted to motor cars.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectropneumaticBrakeType {
    #[default]
    None,
    /// Lock-out valve: no air brake while the motor brake is active.
    ClosingElectromagneticValve,
    /// Air cylinder only fills for demand the motor brake cannot cover.
    DelayFillingControl,
}

/// Whether the car carries its own compressed-air supply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AirBrakeSource {
    /// Compressor, main and equalizing reservoirs on board.
    #[default]
    Main,
    /// Fed from the brake pipe only.
    Auxiliary,
}

/// Inputs to one car's brake update, resolved from the train handles.
#[derive(Debug, Clone, Copy)]
pub struct BrakeContext {
    pub emergency: bool,
    pub reverser: i8,
    pub brake_notch: u8,
    pub maximum_brake_notch: u8,
    pub air_brake_handle: AirBrakeHandleState,
    pub is_motor_car: bool,
    pub speed: si::Velocity,
    pub brake_control_speed: si::Velocity,
    pub motor_deceleration: si::Acceleration,
}

impl BrakeContext {
    fn notch_ratio(&self) -> f64 {
        if self.maximum_brake_notch == 0 {
            0.0
        } else {
            self.brake_notch as f64 / self.maximum_brake_notch as f64
        }
    }
}

/// Brake contribution to a car's deceleration this tick.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BrakeOutput {
    pub deceleration_due_to_brake: si::Acceleration,
    pub deceleration_due_to_motor: si::Acceleration,
}

/// Pressure transferred in one tick for a normalized pressure difference
/// `ratio` and a base amount `base`. Flow slows as the difference closes.
pub fn transfer_rate(ratio: si::Ratio, base: si::Pressure) -> si::Pressure {
    let ratio = ratio.get::<si::ratio>().clamp(0.0, 1.0);
    let ratio = 1.0 - ratio;
    1.5 * (1.01 - ratio * ratio) * base
}

/// Reservoir pressures and transfer constants of one car. Rate fields are
/// pressures transferred per second of elapsed time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarAirBrake {
    pub brake_type: BrakeType,
    pub electropneumatic_type: ElectropneumaticBrakeType,
    pub source: AirBrakeSource,
    // compressor and main reservoir
    #[serde(default)]
    pub compressor_running: bool,
    pub compressor_minimum_pressure: si::Pressure,
    pub compressor_maximum_pressure: si::Pressure,
    pub compressor_rate: si::Pressure,
    pub main_reservoir: si::Pressure,
    pub main_reservoir_equalizing_reservoir_coefficient: f64,
    pub main_reservoir_brake_pipe_coefficient: f64,
    // equalizing reservoir
    pub equalizing_reservoir: si::Pressure,
    pub equalizing_reservoir_normal_pressure: si::Pressure,
    pub equalizing_reservoir_charge_rate: si::Pressure,
    pub equalizing_reservoir_service_rate: si::Pressure,
    pub equalizing_reservoir_emergency_rate: si::Pressure,
    // brake pipe
    pub brake_pipe: si::Pressure,
    pub brake_pipe_normal_pressure: si::Pressure,
    pub brake_pipe_charge_rate: si::Pressure,
    pub brake_pipe_service_rate: si::Pressure,
    pub brake_pipe_emergency_rate: si::Pressure,
    // auxiliary reservoir
    pub auxiliary_reservoir: si::Pressure,
    pub auxiliary_reservoir_maximum_pressure: si::Pressure,
    pub auxiliary_reservoir_charge_rate: si::Pressure,
    pub auxiliary_reservoir_brake_pipe_coefficient: f64,
    pub auxiliary_reservoir_brake_cylinder_coefficient: f64,
    // brake cylinder
    pub brake_cylinder: si::Pressure,
    pub brake_cylinder_service_maximum_pressure: si::Pressure,
    pub brake_cylinder_emergency_maximum_pressure: si::Pressure,
    pub brake_cylinder_service_charge_rate: si::Pressure,
    pub brake_cylinder_emergency_charge_rate: si::Pressure,
    pub brake_cylinder_release_rate: si::Pressure,
    // straight air pipe
    pub straight_air_pipe: si::Pressure,
    pub straight_air_pipe_service_rate: si::Pressure,
    pub straight_air_pipe_release_rate: si::Pressure,
    pub straight_air_pipe_emergency_rate: si::Pressure,
    /// Deceleration produced at service maximum cylinder pressure.
    pub brake_deceleration_at_service_maximum_pressure: si::Acceleration,
}

impl Default for CarAirBrake {
    fn default() -> Self {
        Self {
            brake_type: Default::default(),
            electropneumatic_type: Default::default(),
            source: Default::default(),
            compressor_running: false,
            compressor_minimum_pressure: 690.0 * uc::KPA,
            compressor_maximum_pressure: 780.0 * uc::KPA,
            compressor_rate: 5.0 * uc::KPA,
            main_reservoir: 735.0 * uc::KPA,
            main_reservoir_equalizing_reservoir_coefficient: 0.01,
            main_reservoir_brake_pipe_coefficient: 0.5,
            equalizing_reservoir: 490.0 * uc::KPA,
            equalizing_reservoir_normal_pressure: 490.0 * uc::KPA,
            equalizing_reservoir_charge_rate: 200.0 * uc::KPA,
            equalizing_reservoir_service_rate: 50.0 * uc::KPA,
            equalizing_reservoir_emergency_rate: 250.0 * uc::KPA,
            brake_pipe: 490.0 * uc::KPA,
            brake_pipe_normal_pressure: 490.0 * uc::KPA,
            brake_pipe_charge_rate: 10000.0 * uc::KPA,
            brake_pipe_service_rate: 1500.0 * uc::KPA,
            brake_pipe_emergency_rate: 5000.0 * uc::KPA,
            auxiliary_reservoir: 490.0 * uc::KPA,
            auxiliary_reservoir_maximum_pressure: 490.0 * uc::KPA,
            auxiliary_reservoir_charge_rate: 200.0 * uc::KPA,
            auxiliary_reservoir_brake_pipe_coefficient: 0.5,
            auxiliary_reservoir_brake_cylinder_coefficient: 0.3,
            brake_cylinder: si::Pressure::ZERO,
            brake_cylinder_service_maximum_pressure: 440.0 * uc::KPA,
            brake_cylinder_emergency_maximum_pressure: 440.0 * uc::KPA,
            brake_cylinder_service_charge_rate: 300.0 * uc::KPA,
            brake_cylinder_emergency_charge_rate: 400.0 * uc::KPA,
            brake_cylinder_release_rate: 200.0 * uc::KPA,
            straight_air_pipe: si::Pressure::ZERO,
            straight_air_pipe_service_rate: 300.0 * uc::KPA,
            straight_air_pipe_release_rate: 200.0 * uc::KPA,
            straight_air_pipe_emergency_rate: 400.0 * uc::KPA,
            brake_deceleration_at_service_maximum_pressure: 1.2 * uc::MPS2,
        }
    }
}

impl CarAirBrake {
    /// Runs one tick of the pneumatic circuit and returns the brake and
    /// motor deceleration demands.
    pub fn update(&mut self, ctx: &BrakeContext, dt: si::Time) -> BrakeOutput {
        let dt_s = secs(dt);
        self.update_compressor(dt_s);
        self.update_equalizing_reservoir(ctx, dt_s);
        self.update_brake_pipe(ctx, dt_s);
        match self.brake_type {
            BrakeType::AutomaticAirBrake => self.update_triple_valve(dt_s),
            BrakeType::ElectromagneticStraightAirBrake => self.update_solenoid_valve(ctx, dt_s),
            BrakeType::ElectricCommandBrake => self.update_command_valve(ctx, dt_s),
        }
        self.update_straight_air_pipe(ctx, dt_s);
        self.clamp_pressures();
        let pressure_ratio =
            (self.brake_cylinder / self.brake_cylinder_service_maximum_pressure).get::<si::ratio>();
        let deceleration_due_to_motor = if self.brake_type != BrakeType::AutomaticAirBrake
            && ctx.speed.abs() >= ctx.brake_control_speed
            && ctx.reverser != 0
            && !ctx.emergency
        {
            ctx.notch_ratio() * ctx.motor_deceleration
        } else {
            si::Acceleration::ZERO
        };
        BrakeOutput {
            deceleration_due_to_brake: pressure_ratio
                * self.brake_deceleration_at_service_maximum_pressure,
            deceleration_due_to_motor,
        }
    }

    fn update_compressor(&mut self, dt_s: f64) {
        if self.source != AirBrakeSource::Main {
            return;
        }
        if self.compressor_running {
            if self.main_reservoir > self.compressor_maximum_pressure {
                self.compressor_running = false;
            } else {
                self.main_reservoir += self.compressor_rate * dt_s;
            }
        } else if self.main_reservoir < self.compressor_minimum_pressure {
            self.compressor_running = true;
        }
    }

    fn update_equalizing_reservoir(&mut self, ctx: &BrakeContext, dt_s: f64) {
        if self.source != AirBrakeSource::Main {
            return;
        }
        if ctx.emergency {
            let mut r = transfer_rate(
                self.equalizing_reservoir / self.equalizing_reservoir_normal_pressure,
                self.equalizing_reservoir_emergency_rate * dt_s,
            );
            r = r.min(self.equalizing_reservoir);
            self.equalizing_reservoir -= r;
            return;
        }
        match self.brake_type {
            BrakeType::AutomaticAirBrake => match ctx.air_brake_handle {
                AirBrakeHandleState::Service => {
                    let mut r = transfer_rate(
                        self.equalizing_reservoir / self.equalizing_reservoir_normal_pressure,
                        self.equalizing_reservoir_service_rate * dt_s,
                    );
                    r = r.min(self.equalizing_reservoir);
                    self.equalizing_reservoir -= r;
                }
                AirBrakeHandleState::Release => self.charge_equalizing_reservoir(dt_s),
                AirBrakeHandleState::Lap => {}
            },
            BrakeType::ElectromagneticStraightAirBrake => self.charge_equalizing_reservoir(dt_s),
            BrakeType::ElectricCommandBrake => {}
        }
    }

    fn charge_equalizing_reservoir(&mut self, dt_s: f64) {
        let d = self.equalizing_reservoir_normal_pressure - self.equalizing_reservoir;
        let mut r = transfer_rate(
            d / self.equalizing_reservoir_normal_pressure,
            self.equalizing_reservoir_charge_rate * dt_s,
        );
        r = r.min(d).min(self.main_reservoir - self.equalizing_reservoir);
        if r < si::Pressure::ZERO {
            return;
        }
        let mut s = r * self.main_reservoir_equalizing_reservoir_coefficient * dt_s;
        if s > self.main_reservoir {
            r = r * (self.main_reservoir / s).get::<si::ratio>();
            s = self.main_reservoir;
        }
        self.equalizing_reservoir += 0.5 * r;
        self.main_reservoir -= 0.5 * s;
    }

    fn update_brake_pipe(&mut self, ctx: &BrakeContext, dt_s: f64) {
        if self.source != AirBrakeSource::Main
            || self.brake_type == BrakeType::ElectricCommandBrake
        {
            return;
        }
        if self.brake_pipe > self.equalizing_reservoir + PRESSURE_TOLERANCE {
            // brake pipe exhaust valve
            let base = if ctx.emergency {
                self.brake_pipe_emergency_rate
            } else {
                self.brake_pipe_service_rate
            };
            let d = self.brake_pipe - self.equalizing_reservoir;
            let ratio = (d / self.equalizing_reservoir_normal_pressure).get::<si::ratio>();
            let mut r = (0.5 + 1.5 * ratio) * base * dt_s;
            r = r.min(d);
            self.brake_pipe -= r;
        } else if self.brake_pipe + PRESSURE_TOLERANCE < self.equalizing_reservoir {
            // fill brake pipe from main reservoir
            let d = self.equalizing_reservoir - self.brake_pipe;
            let ratio = (d / self.equalizing_reservoir_normal_pressure).get::<si::ratio>();
            let mut r = (0.5 + 1.5 * ratio) * self.brake_pipe_charge_rate * dt_s;
            r = r.min(d).min(self.brake_pipe_normal_pressure - self.brake_pipe);
            if r < si::Pressure::ZERO {
                return;
            }
            let mut s = r * self.main_reservoir_brake_pipe_coefficient;
            if s > self.main_reservoir {
                r = r * (self.main_reservoir / s).get::<si::ratio>();
                s = self.main_reservoir;
            }
            self.brake_pipe += 0.5 * r;
            self.main_reservoir -= 0.5 * s;
        }
    }

    fn update_triple_valve(&mut self, dt_s: f64) {
        if self.brake_pipe + PRESSURE_TOLERANCE < self.auxiliary_reservoir {
            let urgency = |d: si::Pressure| ((d / PRESSURE_TOLERANCE).get::<si::ratio>() - 1.0).min(1.0);
            if self.auxiliary_reservoir + PRESSURE_TOLERANCE < self.brake_cylinder {
                // back-flow from brake cylinder to auxiliary reservoir
                let u = urgency(self.brake_cylinder - self.auxiliary_reservoir);
                let f = self.auxiliary_reservoir_brake_cylinder_coefficient;
                let d = self.brake_cylinder - self.auxiliary_reservoir;
                let mut r = transfer_rate(
                    u * d / self.auxiliary_reservoir_maximum_pressure,
                    self.brake_cylinder_service_charge_rate * f * dt_s,
                );
                r = r
                    .min(self.auxiliary_reservoir_maximum_pressure - self.auxiliary_reservoir)
                    .min(d);
                let mut s = r * (1.0 / f);
                if s > d {
                    r = r * (d / s).get::<si::ratio>();
                    s = d;
                }
                if s > self.brake_cylinder {
                    r = r * (self.brake_cylinder / s).get::<si::ratio>();
                    s = self.brake_cylinder;
                }
                self.auxiliary_reservoir += 0.5 * r;
                self.brake_cylinder -= 0.5 * s;
            } else if self.auxiliary_reservoir > self.brake_cylinder + PRESSURE_TOLERANCE {
                // service application
                let u = urgency(self.auxiliary_reservoir - self.brake_cylinder);
                let f = self.auxiliary_reservoir_brake_cylinder_coefficient;
                let d = self.auxiliary_reservoir - self.brake_cylinder;
                let mut r = transfer_rate(
                    u * d / self.auxiliary_reservoir_maximum_pressure,
                    self.brake_cylinder_service_charge_rate * f * dt_s,
                );
                r = r.min(self.auxiliary_reservoir).min(d);
                let mut s = r * (1.0 / f);
                if s > d {
                    r = r * (d / s).get::<si::ratio>();
                    s = d;
                }
                let headroom = self.brake_cylinder_emergency_maximum_pressure - self.brake_cylinder;
                if s > headroom {
                    r = r * (headroom / s).get::<si::ratio>();
                    s = headroom;
                }
                self.auxiliary_reservoir -= 0.5 * r;
                self.brake_cylinder += 0.5 * s;
            }
        } else if self.brake_pipe > self.auxiliary_reservoir + PRESSURE_TOLERANCE {
            let u = ((self.brake_pipe - self.auxiliary_reservoir - PRESSURE_TOLERANCE)
                / PRESSURE_TOLERANCE)
                .get::<si::ratio>()
                .min(1.0);
            {
                // refill auxiliary reservoir from brake pipe
                let d = self.brake_pipe - self.auxiliary_reservoir;
                let mut r = transfer_rate(
                    u * d / self.auxiliary_reservoir_maximum_pressure,
                    self.auxiliary_reservoir_charge_rate * dt_s,
                );
                r = r
                    .min(self.brake_pipe)
                    .min(d)
                    .min(self.auxiliary_reservoir_maximum_pressure - self.auxiliary_reservoir);
                let mut s = r * (1.0 / self.auxiliary_reservoir_brake_pipe_coefficient);
                if s > self.brake_pipe {
                    r = r * (self.brake_pipe / s).get::<si::ratio>();
                    s = self.brake_pipe;
                }
                let headroom =
                    self.auxiliary_reservoir_maximum_pressure - self.auxiliary_reservoir;
                if s > headroom {
                    r = r * (headroom / s).get::<si::ratio>();
                    s = headroom;
                }
                self.auxiliary_reservoir += 0.5 * r;
                self.brake_pipe -= 0.5 * s;
            }
            {
                // brake cylinder release
                let mut r = transfer_rate(
                    u * self.brake_cylinder / self.brake_cylinder_emergency_maximum_pressure,
                    self.brake_cylinder_release_rate * dt_s,
                );
                r = r.min(self.brake_cylinder);
                self.brake_cylinder -= r;
            }
        }
    }

    /// Target cylinder pressure after the motor-brake blending rules.
    fn brake_control_target(&self, ctx: &BrakeContext, p: si::Pressure) -> si::Pressure {
        if !ctx.is_motor_car
            || ctx.emergency
            || ctx.reverser == 0
            || ctx.speed.abs() <= ctx.brake_control_speed
        {
            return p;
        }
        match self.electropneumatic_type {
            ElectropneumaticBrakeType::None => p,
            ElectropneumaticBrakeType::ClosingElectromagneticValve => si::Pressure::ZERO,
            ElectropneumaticBrakeType::DelayFillingControl => {
                let demanded = (p / self.brake_cylinder_service_maximum_pressure)
                    .get::<si::ratio>()
                    * self.brake_deceleration_at_service_maximum_pressure;
                let shortfall = demanded - ctx.motor_deceleration;
                if shortfall > si::Acceleration::ZERO {
                    let fraction = (shortfall
                        / self.brake_deceleration_at_service_maximum_pressure)
                        .get::<si::ratio>()
                        .min(1.0);
                    fraction * self.brake_cylinder_service_maximum_pressure
                } else {
                    si::Pressure::ZERO
                }
            }
        }
    }

    fn update_solenoid_valve(&mut self, ctx: &BrakeContext, dt_s: f64) {
        // refill auxiliary reservoir from brake pipe
        if self.brake_pipe > self.auxiliary_reservoir + PRESSURE_TOLERANCE {
            let d = self.brake_pipe - self.auxiliary_reservoir;
            let mut r = transfer_rate(
                d / self.auxiliary_reservoir_maximum_pressure,
                2.0 * self.auxiliary_reservoir_charge_rate * dt_s,
            );
            r = r
                .min(self.brake_pipe)
                .min(d)
                .min(self.auxiliary_reservoir_maximum_pressure - self.auxiliary_reservoir);
            let mut s = r * (1.0 / self.auxiliary_reservoir_brake_pipe_coefficient);
            if s > self.brake_pipe {
                r = r * (self.brake_pipe / s).get::<si::ratio>();
                s = self.brake_pipe;
            }
            let headroom = self.auxiliary_reservoir_maximum_pressure - self.auxiliary_reservoir;
            if s > headroom {
                r = r * (headroom / s).get::<si::ratio>();
                s = headroom;
            }
            self.auxiliary_reservoir += 0.5 * r;
            self.brake_pipe -= 0.5 * s;
        }
        // electric command; a collapsing brake pipe forces emergency
        let emergency =
            self.brake_pipe + PRESSURE_TOLERANCE < self.auxiliary_reservoir || ctx.emergency;
        let mut p = if emergency {
            self.brake_cylinder_emergency_maximum_pressure
        } else {
            ctx.notch_ratio() * self.brake_cylinder_service_maximum_pressure
        };
        p = self.brake_control_target(ctx, p);
        if self.brake_cylinder > p + PRESSURE_TOLERANCE {
            // brake cylinder release
            let d = self.brake_cylinder - p;
            let mut r = transfer_rate(
                d / self.brake_cylinder_emergency_maximum_pressure,
                self.brake_cylinder_release_rate * dt_s,
            );
            r = r.min(self.brake_cylinder).min(d);
            self.brake_cylinder -= r;
        } else if self.brake_cylinder + PRESSURE_TOLERANCE < p {
            // refill brake cylinder from auxiliary reservoir
            let f = self.auxiliary_reservoir_brake_cylinder_coefficient;
            let base = if emergency {
                self.brake_cylinder_emergency_charge_rate
            } else {
                self.brake_cylinder_service_charge_rate
            };
            let d = self.auxiliary_reservoir - self.brake_cylinder;
            let mut r = transfer_rate(
                d / self.brake_cylinder_emergency_maximum_pressure,
                2.0 * base * f * dt_s,
            );
            r = r.min(self.auxiliary_reservoir).min(d);
            let mut s = r * (1.0 / f);
            if s > d {
                r = r * (d / s).get::<si::ratio>();
                s = d;
            }
            let headroom = self.brake_cylinder_emergency_maximum_pressure - self.brake_cylinder;
            if s > headroom {
                r = r * (headroom / s).get::<si::ratio>();
                s = headroom;
            }
            self.auxiliary_reservoir -= 0.5 * r;
            self.brake_cylinder += 0.5 * s;
        }
    }

    fn update_command_valve(&mut self, ctx: &BrakeContext, dt_s: f64) {
        let mut p = if ctx.emergency {
            self.brake_cylinder_emergency_maximum_pressure
        } else {
            ctx.notch_ratio() * self.brake_cylinder_service_maximum_pressure
        };
        p = self.brake_control_target(ctx, p);
        if self.brake_cylinder > p + PRESSURE_TOLERANCE || p == si::Pressure::ZERO {
            // brake cylinder exhaust valve
            let d = self.brake_cylinder;
            let mut r = transfer_rate(
                d / self.brake_cylinder_emergency_maximum_pressure,
                self.brake_cylinder_release_rate * dt_s,
            );
            r = r.min(d);
            self.brake_cylinder -= r;
        } else if (self.brake_cylinder + PRESSURE_TOLERANCE < p
            || p == self.brake_cylinder_emergency_maximum_pressure)
            && self.brake_cylinder + PRESSURE_TOLERANCE < self.main_reservoir
        {
            // fill brake cylinder from main reservoir
            let base = if ctx.emergency {
                self.brake_cylinder_emergency_charge_rate
            } else {
                self.brake_cylinder_service_charge_rate
            };
            let pm = p.min(self.main_reservoir);
            let d = pm - self.brake_cylinder;
            let mut r = transfer_rate(
                d / self.brake_cylinder_emergency_maximum_pressure,
                2.0 * base * dt_s,
            );
            r = r.min(d);
            let f = self.auxiliary_reservoir_brake_cylinder_coefficient
                * self.main_reservoir_brake_pipe_coefficient
                / self.auxiliary_reservoir_brake_pipe_coefficient;
            let mut s = r * f;
            if s > self.main_reservoir {
                r = r * (self.main_reservoir / s).get::<si::ratio>();
                s = self.main_reservoir;
            }
            self.brake_cylinder += 0.5 * r;
            self.main_reservoir -= 0.5 * s;
        }
    }

    fn update_straight_air_pipe(&mut self, ctx: &BrakeContext, dt_s: f64) {
        if self.brake_type == BrakeType::ElectromagneticStraightAirBrake
            && self.source == AirBrakeSource::Main
        {
            let p = if ctx.emergency {
                si::Pressure::ZERO
            } else {
                ctx.notch_ratio() * self.brake_cylinder_service_maximum_pressure
            };
            if p + PRESSURE_TOLERANCE < self.straight_air_pipe {
                let base = if ctx.emergency {
                    self.straight_air_pipe_emergency_rate
                } else {
                    self.straight_air_pipe_release_rate
                };
                let d = self.straight_air_pipe - p;
                let mut r = transfer_rate(
                    d / self.brake_cylinder_emergency_maximum_pressure,
                    base * dt_s,
                );
                r = r.min(d);
                self.straight_air_pipe -= r;
            } else if p > self.straight_air_pipe + PRESSURE_TOLERANCE {
                let d = p - self.straight_air_pipe;
                let mut r = transfer_rate(
                    d / self.brake_cylinder_emergency_maximum_pressure,
                    self.straight_air_pipe_service_rate * dt_s,
                );
                r = r.min(d);
                self.straight_air_pipe += r;
            }
        } else if self.brake_type == BrakeType::ElectricCommandBrake {
            self.straight_air_pipe = if ctx.emergency {
                self.brake_cylinder_emergency_maximum_pressure
            } else {
                ctx.notch_ratio() * self.brake_cylinder_service_maximum_pressure
            };
        }
    }

    fn clamp_pressures(&mut self) {
        let clamp = |p: &mut si::Pressure, max: si::Pressure| {
            *p = (*p).max(si::Pressure::ZERO).min(max);
        };
        clamp(&mut self.main_reservoir, self.compressor_maximum_pressure);
        clamp(
            &mut self.equalizing_reservoir,
            self.equalizing_reservoir_normal_pressure,
        );
        clamp(&mut self.brake_pipe, self.brake_pipe_normal_pressure);
        clamp(
            &mut self.auxiliary_reservoir,
            self.auxiliary_reservoir_maximum_pressure,
        );
        clamp(
            &mut self.brake_cylinder,
            self.brake_cylinder_emergency_maximum_pressure,
        );
        clamp(
            &mut self.straight_air_pipe,
            self.brake_cylinder_emergency_maximum_pressure,
        );
    }
}

impl ObjState for CarAirBrake {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_gtz(
            &mut errors,
            &self.equalizing_reservoir_normal_pressure,
            "Equalizing reservoir normal pressure",
        );
        si_chk_num_gtz(
            &mut errors,
            &self.brake_pipe_normal_pressure,
            "Brake pipe normal pressure",
        );
        si_chk_num_gtz(
            &mut errors,
            &self.auxiliary_reservoir_maximum_pressure,
            "Auxiliary reservoir maximum pressure",
        );
        si_chk_num_gtz(
            &mut errors,
            &self.brake_cylinder_service_maximum_pressure,
            "Brake cylinder service maximum pressure",
        );
        si_chk_num_gtz(
            &mut errors,
            &self.brake_cylinder_emergency_maximum_pressure,
            "Brake cylinder emergency maximum pressure",
        );
        if self.brake_cylinder_emergency_maximum_pressure
            < self.brake_cylinder_service_maximum_pressure
        {
            errors.push(anyhow!(
                "Brake cylinder emergency maximum must be >= service maximum!"
            ));
        }
        chk_num_gtz(
            &mut errors,
            self.main_reservoir_equalizing_reservoir_coefficient,
            "Main reservoir equalizing reservoir coefficient",
        );
        chk_num_gtz(
            &mut errors,
            self.main_reservoir_brake_pipe_coefficient,
            "Main reservoir brake pipe coefficient",
        );
        chk_num_gtz(
            &mut errors,
            self.auxiliary_reservoir_brake_pipe_coefficient,
            "Auxiliary reservoir brake pipe coefficient",
        );
        chk_num_gtz(
            &mut errors,
            self.auxiliary_reservoir_brake_cylinder_coefficient,
            "Auxiliary reservoir brake cylinder coefficient",
        );
        si_chk_num_gez(
            &mut errors,
            &self.brake_deceleration_at_service_maximum_pressure,
            "Brake deceleration at service maximum pressure",
        );
        errors.make_err()
    }
}

impl Valid for CarAirBrake {}

impl Car {
    /// Runs the car's brake update against the train handles and applies the
    /// hold-brake controller on top of the motor output.
    pub(crate) fn update_brake_system(
        &mut self,
        handles: &TrainHandles,
        now: si::Time,
        dt: si::Time,
    ) -> BrakeOutput {
        let ctx = BrakeContext {
            emergency: handles.emergency.actual,
            reverser: handles.reverser_actual,
            brake_notch: handles.brake_notch.actual,
            maximum_brake_notch: handles.maximum_brake_notch,
            air_brake_handle: handles.air_brake.actual,
            is_motor_car: self.is_motor_car,
            speed: self.speed,
            brake_control_speed: self.brake_control_speed,
            motor_deceleration: self.motor_deceleration,
        };
        let mut output = self.air_brake.update(&ctx, dt);
        if handles.hold_brake_actual
            && output.deceleration_due_to_motor == si::Acceleration::ZERO
        {
            if now >= self.hold_brake.next_update_time {
                self.hold_brake.next_update_time = now + self.hold_brake.update_interval;
                self.hold_brake.output +=
                    0.8 * self.acceleration * sign(self.perceived_speed.get::<si::meter_per_second>());
                self.hold_brake.output = self
                    .hold_brake
                    .output
                    .max(si::Acceleration::ZERO)
                    .min(self.motor_deceleration);
            }
            output.deceleration_due_to_motor = self.hold_brake.output;
        } else {
            self.hold_brake.output = si::Acceleration::ZERO;
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::train::AirBrakeHandleState;

    impl Cases for CarAirBrake {}

    #[test]
    fn check_air_brake_cases() {
        check_cases!(CarAirBrake);
    }

    fn context(emergency: bool, notch: u8) -> BrakeContext {
        BrakeContext {
            emergency,
            reverser: 1,
            brake_notch: notch,
            maximum_brake_notch: 8,
            air_brake_handle: AirBrakeHandleState::Release,
            is_motor_car: false,
            speed: 10.0 * uc::MPS,
            brake_control_speed: si::Velocity::ZERO,
            motor_deceleration: si::Acceleration::ZERO,
        }
    }

    fn assert_bounds(brake: &CarAirBrake) {
        assert!(brake.main_reservoir >= si::Pressure::ZERO);
        assert!(brake.main_reservoir <= brake.compressor_maximum_pressure);
        assert!(brake.equalizing_reservoir >= si::Pressure::ZERO);
        assert!(brake.equalizing_reservoir <= brake.equalizing_reservoir_normal_pressure);
        assert!(brake.brake_pipe >= si::Pressure::ZERO);
        assert!(brake.brake_pipe <= brake.brake_pipe_normal_pressure);
        assert!(brake.auxiliary_reservoir >= si::Pressure::ZERO);
        assert!(brake.auxiliary_reservoir <= brake.auxiliary_reservoir_maximum_pressure);
        assert!(brake.brake_cylinder >= si::Pressure::ZERO);
        assert!(brake.brake_cylinder <= brake.brake_cylinder_emergency_maximum_pressure);
    }

    #[test]
    fn test_transfer_rate_shape() {
        let base = 100.0 * uc::KPA;
        // closed difference transfers almost nothing
        assert!(transfer_rate(si::Ratio::ZERO, base) < 2.0 * uc::KPA);
        // full difference transfers at just over the base rate
        assert!(almost_eq_uom(
            &transfer_rate(1.0 * uc::R, base),
            &(1.5 * 1.01 * 100.0 * uc::KPA),
            None
        ));
        // out-of-range ratios clamp
        assert!(almost_eq_uom(
            &transfer_rate(2.0 * uc::R, base),
            &transfer_rate(1.0 * uc::R, base),
            None
        ));
    }

    #[test]
    fn test_command_brake_tracks_notch() {
        let mut brake = CarAirBrake::default();
        let dt = 0.1 * uc::S;
        for _ in 0..600 {
            brake.update(&context(false, 8), dt);
        }
        // full service converges to the service maximum
        assert!(
            brake.brake_cylinder
                > brake.brake_cylinder_service_maximum_pressure - 2.0 * PRESSURE_TOLERANCE
        );
        for _ in 0..600 {
            brake.update(&context(false, 0), dt);
        }
        assert!(brake.brake_cylinder < PRESSURE_TOLERANCE);
    }

    #[test]
    fn test_emergency_fills_cylinder() {
        let mut brake = CarAirBrake::default();
        let dt = 0.1 * uc::S;
        for _ in 0..600 {
            brake.update(&context(true, 0), dt);
        }
        assert!(
            brake.brake_cylinder
                > brake.brake_cylinder_emergency_maximum_pressure - 2.0 * PRESSURE_TOLERANCE
        );
        assert_bounds(&brake);
    }

    #[test]
    fn test_automatic_brake_applies_on_pipe_drop() {
        let mut brake = CarAirBrake {
            brake_type: BrakeType::AutomaticAirBrake,
            ..Default::default()
        };
        let dt = 0.1 * uc::S;
        let mut ctx = context(false, 0);
        ctx.air_brake_handle = AirBrakeHandleState::Service;
        for _ in 0..900 {
            brake.update(&ctx, dt);
        }
        assert!(brake.brake_cylinder > 50.0 * uc::KPA);
        // recharging the pipe releases the cylinder
        ctx.air_brake_handle = AirBrakeHandleState::Release;
        for _ in 0..1800 {
            brake.update(&ctx, dt);
        }
        assert!(brake.brake_cylinder < 2.0 * PRESSURE_TOLERANCE);
        assert_bounds(&brake);
    }

    #[test]
    fn test_pressure_bounds_under_arbitrary_commands() {
        for brake_type in [
            BrakeType::AutomaticAirBrake,
            BrakeType::ElectromagneticStraightAirBrake,
            BrakeType::ElectricCommandBrake,
        ] {
            let mut brake = CarAirBrake {
                brake_type,
                ..Default::default()
            };
            let dt = 0.2 * uc::S;
            for step in 0..2000_u32 {
                let mut ctx = context(step % 11 == 0, (step % 9) as u8);
                ctx.air_brake_handle = match step % 3 {
                    0 => AirBrakeHandleState::Release,
                    1 => AirBrakeHandleState::Lap,
                    _ => AirBrakeHandleState::Service,
                };
                brake.update(&ctx, dt);
                assert_bounds(&brake);
            }
        }
    }

    #[test]
    fn test_compressor_cycles() {
        let mut brake = CarAirBrake {
            main_reservoir: 600.0 * uc::KPA,
            ..Default::default()
        };
        let ctx = context(false, 0);
        brake.update(&ctx, 0.1 * uc::S);
        assert!(brake.compressor_running);
        brake.main_reservoir = brake.compressor_maximum_pressure + 1.0 * uc::KPA;
        brake.update(&ctx, 0.1 * uc::S);
        assert!(!brake.compressor_running);
    }

    #[test]
    fn test_delay_filling_suppresses_air_when_motor_covers_demand() {
        let mut brake = CarAirBrake {
            electropneumatic_type: ElectropneumaticBrakeType::DelayFillingControl,
            ..Default::default()
        };
        let mut ctx = context(false, 4);
        ctx.is_motor_car = true;
        ctx.motor_deceleration = 2.0 * uc::MPS2;
        let dt = 0.1 * uc::S;
        for _ in 0..300 {
            brake.update(&ctx, dt);
        }
        // motor deceleration exceeds the demand, so the cylinder stays empty
        assert!(brake.brake_cylinder < PRESSURE_TOLERANCE);
    }
}
