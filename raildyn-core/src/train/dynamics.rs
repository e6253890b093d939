//! Per-train speed integration: traction, adhesion, jerk-limited output,
//! sign-aware speed stepping, and the within-train coupler pass.

use crate::imports::*;
use crate::sim::SimOptions;
use crate::track::TrackProfile;
use crate::train::{BrakeOutput, Car, Train};

/// Divisor converting accumulated wheelspin (force units) into the
/// perceived-speed perturbation. Tuning constant, not physical.
pub const WHEELSPIN_PERCEIVED_SPEED_DIVISOR: f64 = 2500.0;

/// Below this speed magnitude a car counts as standing for the purpose of
/// holding it against the grade.
const STANDSTILL_SPEED: si::Velocity = si::Velocity {
    dimension: uom::lib::marker::PhantomData,
    units: uom::lib::marker::PhantomData,
    value: 0.01,
};

impl Car {
    /// Shifts both axle followers by `delta` along the track.
    pub(crate) fn translate(
        &mut self,
        profile: &TrackProfile,
        delta: si::Length,
    ) -> anyhow::Result<()> {
        let front = self.front_axle.follower.track_position + delta;
        let rear = self.rear_axle.follower.track_position + delta;
        self.front_axle.follower.advance(profile, front)?;
        self.rear_axle.follower.advance(profile, rear)?;
        Ok(())
    }

    /// Rolling plus aerodynamic resistance for one axle, as a deceleration.
    fn axle_resistance(
        &self,
        exposed: bool,
        speed: si::Velocity,
        options: &SimOptions,
    ) -> si::Acceleration {
        let area = if exposed {
            self.exposed_frontal_area
        } else {
            self.unexposed_frontal_area
        };
        let f = area.get::<si::square_meter>()
            * self.drag_coefficient
            * options.air_density.get::<si::kilogram_per_cubic_meter>()
            / (2.0 * self.mass_current.get::<si::kilogram>());
        let v = speed.get::<si::meter_per_second>().abs();
        (options.gravity.get::<si::meter_per_second_squared>()
            * self.rolling_resistance_coefficient
            + f * v * v)
            * uc::MPS2
    }
}

impl Train {
    /// Runs each car's pneumatic update, then applies brake pipe leakage on
    /// derailed couplings and averages the pipe over the train.
    pub(crate) fn update_brake_system(
        &mut self,
        options: &SimOptions,
        now: si::Time,
        dt: si::Time,
    ) -> Vec<BrakeOutput> {
        let handles = self.handles.clone();
        let mut outputs = Vec::with_capacity(self.cars.len());
        for car in &mut self.cars {
            outputs.push(car.update_brake_system(&handles, now, dt));
        }
        let leak = options.brake_pipe_leak_rate * secs(dt);
        let car_count = self.cars.len();
        let mut total_pressure = si::Pressure::ZERO;
        for i in 0..car_count {
            if i > 0 && (self.cars[i - 1].derailed || self.cars[i].derailed) {
                self.cars[i].air_brake.brake_pipe =
                    (self.cars[i].air_brake.brake_pipe - leak).max(si::Pressure::ZERO);
            }
            if i < car_count - 1 && (self.cars[i].derailed || self.cars[i + 1].derailed) {
                self.cars[i].air_brake.brake_pipe =
                    (self.cars[i].air_brake.brake_pipe - leak).max(si::Pressure::ZERO);
            }
            total_pressure += self.cars[i].air_brake.brake_pipe;
        }
        let average = total_pressure / car_count as f64;
        for car in &mut self.cars {
            car.air_brake.brake_pipe = average;
        }
        outputs
    }

    /// Integrates each car's speed for one tick and resolves coupler
    /// spacing within the train.
    pub(crate) fn update_speeds(
        &mut self,
        profile: &TrackProfile,
        options: &SimOptions,
        now: si::Time,
        dt: si::Time,
    ) -> anyhow::Result<()> {
        let brake_outputs = self.update_brake_system(options, now, dt);
        let dt_s = secs(dt);
        let reverser = self.handles.reverser_actual;
        let power_notch = self.handles.power_notch.actual;
        let emergency = self.handles.emergency.actual;
        let hold_brake = self.handles.hold_brake_actual;
        let const_speed_engaged = self.handles.const_speed;
        let car_count = self.cars.len();
        let mut new_speeds = vec![si::Velocity::ZERO; car_count];
        for i in 0..car_count {
            let exposed_front = i == 0 && self.cars[i].speed >= si::Velocity::ZERO;
            let exposed_rear =
                i == car_count - 1 && self.cars[i].speed <= si::Velocity::ZERO;
            let car = &mut self.cars[i];
            let motor_deceleration = brake_outputs[i].deceleration_due_to_motor;
            let brake_deceleration = brake_outputs[i].deceleration_due_to_brake;
            // rolling on an incline
            let mut power_acceleration = -0.5
                * (car.front_axle.follower.sample.direction_y
                    + car.rear_axle.follower.sample.direction_y)
                * options.gravity;
            // friction, identical at both axles
            let mut friction_acceleration =
                car.axle_resistance(exposed_front || exposed_rear, car.speed, options);
            // critical wheel slip accelerations
            let slip_limit_front =
                car.critical_slip_acceleration(&car.front_axle.follower.sample, options.gravity);
            let slip_limit_rear =
                car.critical_slip_acceleration(&car.rear_axle.follower.sample, options.gravity);
            // power
            let mut wheelspin = 0.0;
            if motor_deceleration == si::Acceleration::ZERO {
                let mut a = si::Acceleration::ZERO;
                if car.is_motor_car
                    && reverser != 0
                    && power_notch > 0
                    && !hold_brake
                    && !emergency
                {
                    a = car.acceleration_output(
                        (power_notch - 1) as usize,
                        reverser as f64 * car.speed,
                    );
                    a = a.min(car.re_adhesion.max_acceleration_output);
                    // wheel slip
                    car.front_axle.slip = a >= slip_limit_front;
                    if car.front_axle.slip {
                        wheelspin += reverser as f64
                            * a.get::<si::meter_per_second_squared>()
                            * car.mass_current.get::<si::kilogram>();
                    }
                    car.rear_axle.slip = a >= slip_limit_rear;
                    if car.rear_axle.slip {
                        wheelspin += reverser as f64
                            * a.get::<si::meter_per_second_squared>()
                            * car.mass_current.get::<si::kilogram>();
                    }
                    let slipping = car.front_axle.slip || car.rear_axle.slip;
                    car.re_adhesion.update(now, a, slipping);
                    // const speed
                    if const_speed_engaged {
                        if now >= car.const_speed.next_update_time {
                            car.const_speed.next_update_time =
                                now + car.const_speed.update_interval;
                            car.const_speed.output -=
                                0.8 * reverser as f64 * car.acceleration;
                            car.const_speed.output =
                                car.const_speed.output.max(si::Acceleration::ZERO);
                        }
                        a = a.min(car.const_speed.output).max(si::Acceleration::ZERO);
                    } else {
                        car.const_speed.output = a;
                    }
                    if wheelspin != 0.0 {
                        a = si::Acceleration::ZERO;
                    }
                } else {
                    car.front_axle.slip = false;
                    car.rear_axle.slip = false;
                }
                // jerk-limited ramp toward the target
                if !car.derailed {
                    if car.motor_acceleration_output < a {
                        let rate = if car.motor_acceleration_output < si::Acceleration::ZERO {
                            car.jerk_brake_down
                        } else {
                            car.jerk_power_up
                        };
                        car.motor_acceleration_output =
                            (car.motor_acceleration_output + rate * dt_s).min(a);
                    } else {
                        car.motor_acceleration_output =
                            (car.motor_acceleration_output - car.jerk_power_down * dt_s).max(a);
                    }
                } else {
                    car.motor_acceleration_output = si::Acceleration::ZERO;
                }
            }
            // brake
            let mut wheellock = wheelspin == 0.0 && car.derailed;
            if !car.derailed && wheelspin == 0.0 {
                // motor brake
                if car.is_motor_car && motor_deceleration != si::Acceleration::ZERO {
                    let target = -motor_deceleration;
                    if car.motor_acceleration_output > target {
                        let rate = if car.motor_acceleration_output > si::Acceleration::ZERO {
                            car.jerk_power_down
                        } else {
                            car.jerk_brake_up
                        };
                        car.motor_acceleration_output =
                            (car.motor_acceleration_output - rate * dt_s).max(target);
                    } else {
                        car.motor_acceleration_output =
                            (car.motor_acceleration_output + car.jerk_brake_down * dt_s)
                                .min(target);
                    }
                }
                // air brake
                let mut a = brake_deceleration;
                if car.speed.abs() <= STANDSTILL_SPEED {
                    // do not let the brake drag a standing car downhill
                    let grade = (0.5
                        * (car.front_axle.follower.sample.direction_y
                            + car.rear_axle.follower.sample.direction_y)
                        * options.gravity)
                        .abs();
                    a = a.min(grade);
                }
                let factor = (car.mass_empty / car.mass_current).get::<si::ratio>();
                if a >= slip_limit_front {
                    wheellock = true;
                } else {
                    friction_acceleration += 0.5 * factor * a;
                }
                if a >= slip_limit_rear {
                    wheellock = true;
                } else {
                    friction_acceleration += 0.5 * factor * a;
                }
            } else if car.derailed {
                friction_acceleration += options.ground_friction_coefficient * options.gravity;
            }
            // apply motor output
            if reverser != 0 {
                let factor = (car.mass_empty / car.mass_current).get::<si::ratio>();
                if car.motor_acceleration_output > si::Acceleration::ZERO {
                    power_acceleration +=
                        reverser as f64 * factor * car.motor_acceleration_output;
                } else {
                    let a = -car.motor_acceleration_output;
                    if a >= slip_limit_front {
                        car.front_axle.slip = true;
                    } else if !car.derailed {
                        friction_acceleration += 0.5 * factor * a;
                    }
                    if a >= slip_limit_rear {
                        car.rear_axle.slip = true;
                    } else {
                        friction_acceleration += 0.5 * factor * a;
                    }
                }
            } else {
                car.motor_acceleration_output = si::Acceleration::ZERO;
            }
            // perceived speed
            {
                let speed = car.speed.get::<si::meter_per_second>();
                let target = if wheellock {
                    0.0
                } else if wheelspin == 0.0 {
                    speed
                } else {
                    speed + wheelspin / WHEELSPIN_PERCEIVED_SPEED_DIVISOR
                };
                let perceived = car.perceived_speed.get::<si::meter_per_second>();
                let diff = target - perceived;
                let mut rate = (if diff < 0.0 { 5.0 } else { 1.0 })
                    * options.gravity.get::<si::meter_per_second_squared>()
                    * dt_s;
                rate *= 1.0 - 0.7 / (diff * diff + 1.0);
                let factor = rate * rate;
                rate *= 1.0 - factor / (factor + 1000.0);
                if diff.abs() <= rate {
                    car.perceived_speed = target * uc::MPS;
                } else {
                    car.perceived_speed = (perceived + rate * sign(diff)) * uc::MPS;
                }
            }
            car.perceived_travel_distance += car.perceived_speed.abs() * dt;
            // new speed, stopping exactly at zero within the tick
            {
                let speed = car.speed.get::<si::meter_per_second>();
                let d = sign(speed);
                let a = power_acceleration.get::<si::meter_per_second_squared>();
                let b = friction_acceleration.get::<si::meter_per_second_squared>();
                let new_speed = if a.abs() < b {
                    if sign(a) == d {
                        if d == 0.0 {
                            0.0
                        } else {
                            let c = (b - a.abs()) * dt_s;
                            if speed.abs() > c {
                                speed - d * c
                            } else {
                                0.0
                            }
                        }
                    } else {
                        let c = (a.abs() + b) * dt_s;
                        if speed.abs() > c {
                            speed - d * c
                        } else {
                            0.0
                        }
                    }
                } else {
                    speed + (a - b * d) * dt_s
                };
                new_speeds[i] = new_speed * uc::MPS;
            }
        }
        self.resolve_couplers(profile, options, &mut new_speeds)?;
        // commit speeds and averages
        let inv_time = if dt_s != 0.0 { 1.0 / dt_s } else { 1.0 };
        let mut average_speed = si::Velocity::ZERO;
        let mut average_acceleration = si::Acceleration::ZERO;
        for (car, new_speed) in self.cars.iter_mut().zip(&new_speeds) {
            car.acceleration = (*new_speed - car.speed)
                .get::<si::meter_per_second>()
                * inv_time
                * uc::MPS2;
            car.speed = *new_speed;
            average_speed += *new_speed;
            average_acceleration += car.acceleration;
        }
        let inv_cars = 1.0 / car_count as f64;
        self.average_speed = average_speed * inv_cars;
        self.average_acceleration = average_acceleration * inv_cars;
        Ok(())
    }

    /// Restores coupler spacing around the center of mass and merges the
    /// speeds of colliding runs of cars.
    fn resolve_couplers(
        &mut self,
        profile: &TrackProfile,
        options: &SimOptions,
        new_speeds: &mut [si::Velocity],
    ) -> anyhow::Result<()> {
        let car_count = self.cars.len();
        if car_count < 2 {
            return Ok(());
        }
        let mut positions: Vec<f64> = self
            .cars
            .iter()
            .map(|car| car.center_position().get::<si::meter>())
            .collect();
        let masses: Vec<f64> = self
            .cars
            .iter()
            .map(|car| car.mass_current.get::<si::kilogram>())
            .collect();
        let total_mass: f64 = masses.iter().sum();
        let center_of_mass = if total_mass != 0.0 {
            positions
                .iter()
                .zip(&masses)
                .map(|(p, m)| p * m)
                .sum::<f64>()
                / total_mass
        } else {
            0.0
        };
        // cars nearest the center of mass anchor the pass
        let mut primary = 0;
        let mut primary_distance = f64::MAX;
        for (i, position) in positions.iter().enumerate() {
            let d = (position - center_of_mass).abs();
            if d < primary_distance {
                primary_distance = d;
                primary = i;
            }
        }
        let mut secondary: Option<usize> = None;
        let mut second_distance = f64::MAX;
        for i in [primary.wrapping_sub(1), primary + 1] {
            if i < car_count && i != primary {
                let d = (positions[i] - center_of_mass).abs();
                if d < second_distance {
                    second_distance = d;
                    secondary = Some(i);
                }
            }
        }
        if secondary.is_some() && primary_distance <= 0.25 * (primary_distance + second_distance)
        {
            secondary = None;
        }
        let mut collision = vec![false; self.couplers.len()];
        let (front_anchor, rear_anchor) = if let Some(s) = secondary {
            let (p, s) = if primary > s { (s, primary) } else { (primary, s) };
            let min = self.couplers[p].min_distance.get::<si::meter>();
            let max = self.couplers[p].max_distance.get::<si::meter>();
            let gap = positions[p]
                - positions[s]
                - 0.5 * (self.cars[p].length + self.cars[s].length).get::<si::meter>();
            if gap < min {
                let t = (min - gap) / (masses[p] + masses[s]);
                let tp = t * masses[s];
                let ts = t * masses[p];
                self.cars[p].translate(profile, tp * uc::M)?;
                self.cars[s].translate(profile, -ts * uc::M)?;
                positions[p] += tp;
                positions[s] -= ts;
                collision[p] = true;
            } else if gap > max && !self.cars[p].derailed && !self.cars[s].derailed {
                let t = (gap - max) / (masses[p] + masses[s]);
                let tp = t * masses[s];
                let ts = t * masses[p];
                self.cars[p].translate(profile, -tp * uc::M)?;
                self.cars[s].translate(profile, ts * uc::M)?;
                positions[p] -= tp;
                positions[s] += ts;
                collision[p] = true;
            }
            (p, s)
        } else {
            (primary, primary)
        };
        // cars ahead of the anchor
        for i in (0..front_anchor).rev() {
            let min = self.couplers[i].min_distance.get::<si::meter>();
            let max = self.couplers[i].max_distance.get::<si::meter>();
            let gap = positions[i]
                - positions[i + 1]
                - 0.5 * (self.cars[i].length + self.cars[i + 1].length).get::<si::meter>();
            if gap < min {
                let t = min - gap + 0.0001;
                self.cars[i].translate(profile, t * uc::M)?;
                positions[i] += t;
                collision[i] = true;
            } else if gap > max && !self.cars[i].derailed && !self.cars[i + 1].derailed {
                let t = gap - max + 0.0001;
                self.cars[i].translate(profile, -t * uc::M)?;
                positions[i] -= t;
                collision[i] = true;
            }
        }
        // cars behind the anchor
        for i in (rear_anchor + 1)..car_count {
            let min = self.couplers[i - 1].min_distance.get::<si::meter>();
            let max = self.couplers[i - 1].max_distance.get::<si::meter>();
            let gap = positions[i - 1]
                - positions[i]
                - 0.5 * (self.cars[i].length + self.cars[i - 1].length).get::<si::meter>();
            if gap < min {
                let t = min - gap + 0.0001;
                self.cars[i].translate(profile, -t * uc::M)?;
                positions[i] -= t;
                collision[i - 1] = true;
            } else if gap > max && !self.cars[i].derailed && !self.cars[i - 1].derailed {
                let t = gap - max + 0.0001;
                self.cars[i].translate(profile, t * uc::M)?;
                positions[i] += t;
                collision[i - 1] = true;
            }
        }
        // colliding runs of cars take their momentum-weighted mean speed
        let mut i = 0;
        while i < collision.len() {
            if collision[i] {
                let mut j = i + 1;
                while j < collision.len() && collision[j] {
                    j += 1;
                }
                let mut momentum = 0.0;
                let mut mass = 0.0;
                for k in i..=j {
                    momentum += new_speeds[k].get::<si::meter_per_second>() * masses[k];
                    mass += masses[k];
                }
                let merged = if mass != 0.0 { momentum / mass } else { 0.0 };
                for k in i..=j {
                    if options.derailments
                        && (merged - new_speeds[k].get::<si::meter_per_second>()).abs()
                            > 0.5
                                * options
                                    .critical_collision_speed_difference
                                    .get::<si::meter_per_second>()
                    {
                        log::warn!("car {k} derailed in a coupler collision");
                        self.cars[k].derailed = true;
                    }
                    new_speeds[k] = merged * uc::MPS;
                }
                i = j;
            } else {
                i += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{AxleFollower, TrackPoint};

    fn flat_profile() -> TrackProfile {
        TrackProfile {
            points: vec![
                TrackPoint::default(),
                TrackPoint {
                    offset: 5000.0 * uc::M,
                    ..TrackPoint::default()
                },
            ],
            beacons: Vec::new(),
        }
    }

    fn placed_train(profile: &TrackProfile, front: si::Length) -> Train {
        let mut train = Train::valid();
        let spacings: Vec<si::Length> = train
            .couplers
            .iter()
            .map(|coupler| 0.5 * (coupler.min_distance + coupler.max_distance))
            .collect();
        let mut cursor = front;
        for (i, car) in train.cars.iter_mut().enumerate() {
            let center = cursor - 0.5 * car.length;
            car.front_axle.follower =
                AxleFollower::new(profile, center + car.front_axle.offset).unwrap();
            car.rear_axle.follower =
                AxleFollower::new(profile, center + car.rear_axle.offset).unwrap();
            cursor -= car.length;
            if let Some(spacing) = spacings.get(i) {
                cursor -= *spacing;
            }
        }
        train
    }

    #[test]
    fn test_braking_car_stops_exactly_at_zero() {
        let profile = flat_profile();
        let options = SimOptions::default();
        let mut train = placed_train(&profile, 200.0 * uc::M);
        for car in &mut train.cars {
            car.speed = 0.05 * uc::MPS;
            car.air_brake.brake_cylinder = car.air_brake.brake_cylinder_service_maximum_pressure;
        }
        // one tick of brake deceleration removes far more speed than remains
        train
            .update_speeds(&profile, &options, si::Time::ZERO, 0.1 * uc::S)
            .unwrap();
        for car in &train.cars {
            assert_eq!(car.speed, si::Velocity::ZERO);
            assert!(car.acceleration < si::Acceleration::ZERO);
        }
        assert_eq!(train.average_speed, si::Velocity::ZERO);
    }

    #[test]
    fn test_friction_never_reverses_a_coasting_car() {
        let profile = flat_profile();
        let options = SimOptions::default();
        let mut train = placed_train(&profile, 200.0 * uc::M);
        for car in &mut train.cars {
            car.speed = 0.001 * uc::MPS;
        }
        train
            .update_speeds(&profile, &options, si::Time::ZERO, 1.0 * uc::S)
            .unwrap();
        // rolling resistance over a full second exceeds the remaining speed
        for car in &train.cars {
            assert_eq!(car.speed, si::Velocity::ZERO);
        }
    }

    fn assert_couplers_within_bounds(train: &Train, eps: si::Length) {
        for (i, coupler) in train.couplers.iter().enumerate() {
            let gap = train.cars[i].rear_position() - train.cars[i + 1].front_position();
            assert!(gap >= coupler.min_distance - eps);
            assert!(gap <= coupler.max_distance + eps);
        }
    }

    #[test]
    fn test_coupler_resolution_restores_spacing() {
        let profile = flat_profile();
        let options = SimOptions::default();
        let eps = 0.001 * uc::M;
        // rear car shoved into the front car
        let mut train = placed_train(&profile, 200.0 * uc::M);
        train.cars[1].translate(&profile, 2.0 * uc::M).unwrap();
        let mut speeds = vec![si::Velocity::ZERO; train.cars.len()];
        train
            .resolve_couplers(&profile, &options, &mut speeds)
            .unwrap();
        assert_couplers_within_bounds(&train, eps);
        assert!(!train.is_derailed());
        // rear car pulled away from the front car
        let mut train = placed_train(&profile, 200.0 * uc::M);
        train.cars[1].translate(&profile, -2.0 * uc::M).unwrap();
        let mut speeds = vec![si::Velocity::ZERO; train.cars.len()];
        train
            .resolve_couplers(&profile, &options, &mut speeds)
            .unwrap();
        assert_couplers_within_bounds(&train, eps);
        assert!(!train.is_derailed());
    }

    #[test]
    fn test_coupler_resolution_skips_derailed_stretch() {
        let profile = flat_profile();
        let options = SimOptions::default();
        let mut train = placed_train(&profile, 200.0 * uc::M);
        train.cars[0].derailed = true;
        train.cars[1].translate(&profile, -2.0 * uc::M).unwrap();
        let before = train.cars[1].front_position();
        let mut speeds = vec![si::Velocity::ZERO; train.cars.len()];
        train
            .resolve_couplers(&profile, &options, &mut speeds)
            .unwrap();
        // a derailed coupling is not pulled back together
        assert_eq!(train.cars[1].front_position(), before);
        let gap = train.cars[0].rear_position() - train.cars[1].front_position();
        assert!(gap > train.couplers[0].max_distance);
    }
}
