//! Trains: consists of cars joined by couplers, their driver controls, and
//! the per-tick motion, station, door, and passenger updates.

use crate::imports::*;
use crate::plugin::DoorState;
use crate::signal::{SectionIdx, Station, StationType};
use crate::sim::SimOptions;
use crate::track::TrackProfile;

mod air_brake;
mod car;
mod dynamics;
mod handles;

pub use air_brake::*;
pub use car::*;
pub use dynamics::*;
pub use handles::*;

use serde::{de::Visitor, Deserializer, Serializer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TrainIdx {
    idx: u32,
}
pub const TRAIN_IDX_NA: TrainIdx = TrainIdx { idx: 0 };

impl TrainIdx {
    pub fn new(idx: u32) -> Self {
        Self { idx }
    }
    pub fn idx(&self) -> usize {
        self.idx.idx()
    }
}

impl std::hash::Hash for TrainIdx {
    fn hash<H: std::hash::Hasher>(&self, hasher: &mut H) {
        hasher.write_u32(self.idx);
    }
}

impl fmt::Display for TrainIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.idx)
    }
}

impl Serialize for TrainIdx {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.idx)
    }
}

impl<'de> Deserialize<'de> for TrainIdx {
    fn deserialize<D>(deserializer: D) -> Result<TrainIdx, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TrainIdxVisitor;
        impl<'de> Visitor<'de> for TrainIdxVisitor {
            type Value = TrainIdx;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("integer")
            }

            fn visit_u32<E>(self, v: u32) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(TrainIdx::new(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v <= u64::from(u32::MAX) {
                    Ok(TrainIdx::new(v as u32))
                } else {
                    Err(E::custom(format!("u32 out of range: {v}")))
                }
            }
        }

        deserializer.deserialize_u32(TrainIdxVisitor)
    }
}

impl Valid for TrainIdx {
    fn valid() -> Self {
        Self { idx: 1 }
    }
}

impl ObjState for TrainIdx {
    fn is_fake(&self) -> bool {
        self.idx == 0
    }
}

/// Whether a train takes part in the simulation yet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, IsVariant)]
pub enum TrainStatus {
    /// Not yet introduced; waiting for its timetable slot and a free section.
    #[default]
    Pending,
    /// Running on the track.
    Available,
    /// Present for scripting purposes only; skipped by physics and signaling.
    Bogus,
    /// Removed from service.
    Disposed,
}

/// Progress through a station stop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainStopState {
    #[default]
    Pending,
    Boarding,
    Completed,
}

/// The connection between two adjacent cars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coupler {
    pub min_distance: si::Length,
    pub max_distance: si::Length,
}

impl Default for Coupler {
    fn default() -> Self {
        Self {
            min_distance: 0.27 * uc::M,
            max_distance: 0.33 * uc::M,
        }
    }
}

impl ObjState for Coupler {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_gez(&mut errors, &self.min_distance, "Minimum coupler distance");
        si_chk_num_gez(&mut errors, &self.max_distance, "Maximum coupler distance");
        if self.max_distance < self.min_distance {
            errors.push(anyhow!(
                "Maximum coupler distance must not be below the minimum!"
            ));
        }
        errors.make_err()
    }
}

/// Lagged passenger comfort model. The felt acceleration trails the train's
/// and the residual speed difference decides whether passengers fall over.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainPassengers {
    pub ratio: f64,
    pub current_acceleration: si::Acceleration,
    pub current_speed_difference: si::Velocity,
    pub fallen_over: bool,
}

impl TrainPassengers {
    pub fn update(&mut self, average_acceleration: si::Acceleration, dt: si::Time) {
        let dt_s = secs(dt);
        let target = average_acceleration.get::<si::meter_per_second_squared>();
        let mut felt = self.current_acceleration.get::<si::meter_per_second_squared>();
        let mut diff = target - felt;
        let jerk = 0.25 + 0.10 * diff.abs();
        let quanta = jerk * dt_s;
        if diff.abs() < quanta {
            felt = target;
            diff = 0.0;
        } else {
            felt += sign(diff) * quanta;
            diff = target - felt;
        }
        self.current_acceleration = felt * uc::MPS2;
        let mut speed_diff = self.current_speed_difference.get::<si::meter_per_second>();
        speed_diff += diff * dt_s;
        let decay = 0.10 + 0.35 * speed_diff.abs();
        let quanta = decay * dt_s;
        if speed_diff.abs() < quanta {
            speed_diff = 0.0;
        } else {
            speed_diff -= sign(speed_diff) * quanta;
        }
        self.current_speed_difference = speed_diff * uc::MPS;
        self.fallen_over = self.ratio > 0.0 && speed_diff.abs() > 1.0 / self.ratio;
    }
}

/// Train-level door state. Each side animates between 0 (closed) and 1
/// (open) at a fixed rate toward its anticipated position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainDoors {
    pub anticipated_left: bool,
    pub anticipated_right: bool,
    #[serde(default)]
    pub state_left: f64,
    #[serde(default)]
    pub state_right: f64,
    /// Opening rate in fraction per second.
    pub open_rate: f64,
    /// Closing rate in fraction per second.
    pub close_rate: f64,
}

impl Default for TrainDoors {
    fn default() -> Self {
        Self {
            anticipated_left: false,
            anticipated_right: false,
            state_left: 0.0,
            state_right: 0.0,
            open_rate: 0.8,
            close_rate: 0.4,
        }
    }
}

impl TrainDoors {
    pub fn open(&mut self, left: bool, right: bool) {
        self.anticipated_left |= left;
        self.anticipated_right |= right;
    }

    pub fn close(&mut self, left: bool, right: bool) {
        self.anticipated_left &= !left;
        self.anticipated_right &= !right;
    }

    pub fn any_open(&self) -> bool {
        self.state_left > 0.0 || self.state_right > 0.0
    }

    pub fn state(&self) -> DoorState {
        DoorState {
            left: self.state_left > 0.0,
            right: self.state_right > 0.0,
        }
    }

    /// Animates the panels for one tick. Returns the old and new aggregate
    /// state when they differ.
    pub fn update(&mut self, dt: si::Time) -> Option<(DoorState, DoorState)> {
        let old = self.state();
        let dt_s = secs(dt);
        if self.anticipated_left {
            self.state_left = (self.state_left + self.open_rate * dt_s).min(1.0);
        } else {
            self.state_left = (self.state_left - self.close_rate * dt_s).max(0.0);
        }
        if self.anticipated_right {
            self.state_right = (self.state_right + self.open_rate * dt_s).min(1.0);
        } else {
            self.state_right = (self.state_right - self.close_rate * dt_s).max(0.0);
        }
        let new = self.state();
        (old != new).then_some((old, new))
    }
}

fn unlimited_speed() -> si::Velocity {
    f64::INFINITY * uc::MPS
}

/// A consist of cars under one set of driver controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Train {
    #[serde(default)]
    pub status: TrainStatus,
    pub cars: Vec<Car>,
    pub couplers: Vec<Coupler>,
    pub handles: TrainHandles,
    #[serde(default)]
    pub driver_car: usize,
    /// The signaling section the front of the train occupies.
    #[serde(default)]
    pub current_section: SectionIdx,
    /// Index into the station list while inside a station zone.
    #[serde(default)]
    pub station: Option<usize>,
    #[serde(default)]
    pub station_state: TrainStopState,
    #[serde(default)]
    pub station_arrival_time: Option<si::Time>,
    #[serde(default)]
    pub station_departure_time: Option<si::Time>,
    #[serde(default)]
    pub station_distance_to_stop_point: si::Length,
    #[serde(default)]
    pub doors: TrainDoors,
    /// Offset between the timetable's clock and the simulation clock.
    #[serde(default)]
    pub timetable_delta: si::Time,
    /// Speed limit from the signaling section the train runs in. Zero
    /// means the train has passed a red signal.
    #[serde(default = "unlimited_speed")]
    pub current_section_limit: si::Velocity,
    /// Speed limit of the route itself.
    #[serde(default = "unlimited_speed")]
    pub current_route_limit: si::Velocity,
    #[serde(default)]
    pub passengers: TrainPassengers,
    #[serde(default)]
    pub average_speed: si::Velocity,
    #[serde(default)]
    pub average_acceleration: si::Acceleration,
}

impl Train {
    /// Track position of the leading face of the first car.
    pub fn front_position(&self) -> si::Length {
        match self.cars.first() {
            Some(car) => car.front_position(),
            None => si::Length::ZERO,
        }
    }

    /// Track position of the trailing face of the last car.
    pub fn rear_position(&self) -> si::Length {
        match self.cars.last() {
            Some(car) => car.rear_position(),
            None => si::Length::ZERO,
        }
    }

    pub fn is_derailed(&self) -> bool {
        self.cars.iter().any(|car| car.derailed)
    }

    /// Clears derailment and toppling state on every car.
    pub fn underail(&mut self) {
        for car in &mut self.cars {
            car.roll_due_to_topple = si::Angle::ZERO;
            car.topples = false;
            car.derailed = false;
        }
    }

    /// Moves every car along the track by its own speed over `dt` and
    /// updates the roll and topple state.
    pub fn move_cars(
        &mut self,
        profile: &TrackProfile,
        options: &SimOptions,
        dt: si::Time,
    ) -> anyhow::Result<()> {
        for car in &mut self.cars {
            let delta = car.speed * dt;
            car.translate(profile, delta)?;
            car.update_topple(options, dt);
        }
        Ok(())
    }

    /// Called when the front of the train enters a station zone.
    pub fn enter_station_zone(&mut self, station: usize) {
        if self.station != Some(station) {
            self.station = Some(station);
            self.station_state = TrainStopState::Pending;
            self.station_arrival_time = None;
            self.station_departure_time = None;
        }
    }

    pub fn leave_station_zone(&mut self) {
        self.station = None;
        self.station_state = TrainStopState::Pending;
    }

    /// Advances the station-stop state machine. Returns the station index
    /// to jump to when a change-ends stop completes.
    pub fn update_station(
        &mut self,
        stations: &[Station],
        is_player: bool,
        now: si::Time,
    ) -> Option<usize> {
        let mut jump_target = None;
        if let Some(i) = self.station {
            let station = &stations[i];
            let n = station.stop_index(self.cars.len());
            let (forward_tolerance, backward_tolerance) = match station.stops.get(n) {
                Some(stop) => {
                    self.station_distance_to_stop_point =
                        stop.track_position - self.front_position();
                    (stop.forward_tolerance, stop.backward_tolerance)
                }
                None => {
                    self.station_distance_to_stop_point = si::Length::ZERO;
                    (5.0 * uc::M, 5.0 * uc::M)
                }
            };
            match self.station_state {
                TrainStopState::Pending => {
                    if station.stops_at(is_player) {
                        let slow = self.average_speed.abs() < 0.1 / 3.6 * uc::MPS
                            && self.average_acceleration.abs() < 0.1 / 3.6 * uc::MPS2;
                        let within = self.station_distance_to_stop_point < backward_tolerance
                            && -self.station_distance_to_stop_point < forward_tolerance;
                        if slow && within {
                            self.doors
                                .open(station.open_left_doors, station.open_right_doors);
                        }
                        // arrival once the doors the station calls for have opened
                        let creeping = self.average_speed.abs() < 1.0 * uc::KPH;
                        let left_ready =
                            !station.open_left_doors || self.doors.anticipated_left;
                        let right_ready =
                            !station.open_right_doors || self.doors.anticipated_right;
                        if creeping && left_ready && right_ready {
                            self.station_state = TrainStopState::Boarding;
                            self.station_arrival_time = Some(now);
                            let mut departure = match station.departure_time {
                                Some(t) => t - self.timetable_delta,
                                None => now,
                            };
                            if departure - now < station.stop_time {
                                departure = now + station.stop_time;
                            }
                            self.station_departure_time = Some(departure);
                            self.passengers.ratio = station.passenger_ratio;
                            self.update_mass_from_passenger_ratio();
                        }
                    }
                }
                TrainStopState::Boarding => {
                    let departure = self.station_departure_time.unwrap_or(now);
                    // close the doors early enough to depart on time
                    if station.station_type == StationType::Normal
                        && secs(now) >= secs(departure) - 1.0 / self.doors.close_rate
                    {
                        self.doors.close(true, true);
                    }
                    let opens_any = station.open_left_doors || station.open_right_doors;
                    if !opens_any || self.doors.any_open() {
                        if now > departure {
                            self.station_state = TrainStopState::Completed;
                            if station.station_type == StationType::ChangeEnds {
                                jump_target = Some(i + 1);
                            }
                        }
                    } else {
                        self.station_state = TrainStopState::Completed;
                    }
                }
                TrainStopState::Completed => {}
            }
        } else {
            self.station_state = TrainStopState::Pending;
        }
        // doors close automatically outside a boarding stop
        if self.station.is_none() || self.station_state == TrainStopState::Completed {
            self.doors.close(true, true);
        }
        jump_target
    }

    /// Animates the doors. Returns the transition for plugin notification.
    pub fn update_doors(&mut self, dt: si::Time) -> Option<(DoorState, DoorState)> {
        self.doors.update(dt)
    }

    pub fn update_passengers(&mut self, dt: si::Time) {
        self.passengers.update(self.average_acceleration, dt);
    }

    /// Reloads every car's mass from the boarded passenger ratio at 70 kg a
    /// head, one passenger per square meter of cabin area.
    pub fn update_mass_from_passenger_ratio(&mut self) {
        let per_passenger = 70.0 * uc::KG;
        for car in &mut self.cars {
            let area = car.cabin_area.get::<si::square_meter>();
            let passengers = (self.passengers.ratio * area).round();
            car.mass_current = car.mass_empty + passengers * per_passenger;
        }
    }
}

impl Car {
    /// Updates the roll-due-to-topple angle, the topple flag, and the
    /// derailment check against the critical toppling angle.
    pub(crate) fn update_topple(&mut self, options: &SimOptions, dt: si::Time) {
        let dt_s = secs(dt);
        let gauge = options.rail_gauge.get::<si::meter>();
        let g = options.gravity.get::<si::meter_per_second_squared>();
        // cant angle from both axle samples
        let ca = self.front_axle.follower.sample.cant.get::<si::meter>();
        let cb = self.rear_axle.follower.sample.cant.get::<si::meter>();
        let c = (0.5 * (ca.atan() + cb.atan())).tan();
        let cant_angle = (c / gauge).atan();
        // effective curve radius and its sign
        let rf = self.front_axle.follower.sample.curve_radius.get::<si::meter>();
        let rr = self.rear_axle.follower.sample.curve_radius.get::<si::meter>();
        let (r, rs) = if rf != 0.0 && rr != 0.0 {
            ((rf * rr).abs().sqrt(), sign(rf + rr))
        } else if rf != 0.0 {
            (rf.abs(), sign(rf))
        } else if rr != 0.0 {
            (rr.abs(), sign(rr))
        } else {
            (0.0, 0.0)
        };
        let mut a = self.roll_due_to_topple.get::<si::radian>();
        let ab = a + cant_angle;
        if options.derailments && !self.derailed {
            let critical = self.critical_toppling_angle.get::<si::radian>();
            if ab.abs() > critical {
                self.derailed = true;
            }
        }
        if options.toppling || self.derailed {
            let h = self.center_of_gravity_height.get::<si::meter>();
            let s = self.speed.get::<si::meter_per_second>().abs();
            let rmax = 2.0 * h * s * s / (g * gauge);
            self.topples = false;
            let target = if self.derailed {
                let sab = if ab == 0.0 { 1.0 } else { sign(ab) };
                0.5 * std::f64::consts::PI * sab
            } else if r != 0.0 && r < rmax {
                // past the overturn speed for this curve
                let s0 = (r * g * gauge / (2.0 * h)).sqrt();
                self.topples = true;
                -0.25 * (s - s0) * rs
            } else {
                0.0
            };
            let rate = if self.derailed {
                ab.abs().max(0.1)
            } else {
                1.0
            };
            let d = (target - a).abs();
            a += sign(target - a) * rate.min(d / dt_s.max(f64::EPSILON)) * dt_s;
            self.roll_due_to_topple = a * uc::RAD;
        } else {
            self.roll_due_to_topple = si::Angle::ZERO;
        }
    }
}

impl ObjState for Train {
    fn is_fake(&self) -> bool {
        self.cars.is_empty()
    }
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        early_fake_ok!(self);
        if self.couplers.len() + 1 != self.cars.len() {
            errors.push(anyhow!(
                "Coupler count must be one less than the car count!"
            ));
        }
        if self.driver_car >= self.cars.len() {
            errors.push(anyhow!("Driver car index must name an existing car!"));
        }
        validate_slice_real(&mut errors, &self.cars, "Car");
        validate_slice_real(&mut errors, &self.couplers, "Coupler");
        validate_field_real(&mut errors, &self.handles, "Handles");
        errors.make_err()
    }
}

impl Valid for Train {
    fn valid() -> Self {
        Self {
            status: TrainStatus::Available,
            cars: vec![Car::valid(), Car::valid()],
            couplers: vec![Coupler::default()],
            handles: TrainHandles::valid(),
            ..Default::default()
        }
    }
}

impl Default for Train {
    fn default() -> Self {
        Self {
            status: Default::default(),
            cars: Vec::new(),
            couplers: Vec::new(),
            handles: Default::default(),
            driver_car: 0,
            current_section: Default::default(),
            station: None,
            station_state: Default::default(),
            station_arrival_time: None,
            station_departure_time: None,
            station_distance_to_stop_point: si::Length::ZERO,
            doors: Default::default(),
            timetable_delta: si::Time::ZERO,
            current_section_limit: unlimited_speed(),
            current_route_limit: unlimited_speed(),
            passengers: Default::default(),
            average_speed: si::Velocity::ZERO,
            average_acceleration: si::Acceleration::ZERO,
        }
    }
}

impl SerdeAPI for Train {
    fn init(&mut self) -> anyhow::Result<()> {
        self.validate().map_err(|errors| anyhow!("{errors}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::StationStop;
    use crate::testing::*;

    impl Cases for TrainIdx {
        fn real_cases() -> Vec<Self> {
            vec![Self::valid()]
        }
        fn fake_cases() -> Vec<Self> {
            vec![Self::new(0)]
        }
    }

    impl Cases for Train {
        fn fake_cases() -> Vec<Self> {
            vec![Self::default()]
        }
    }

    #[test]
    fn check_train_cases() {
        check_cases!(TrainIdx);
        check_cases!(Train);
    }

    #[test]
    fn test_passengers_fall_over_on_harsh_braking() {
        let mut passengers = TrainPassengers {
            ratio: 1.0,
            ..Default::default()
        };
        let dt = 0.1 * uc::S;
        for _ in 0..50 {
            passengers.update(-3.0 * uc::MPS2, dt);
        }
        assert!(passengers.fallen_over);
        for _ in 0..200 {
            passengers.update(si::Acceleration::ZERO, dt);
        }
        assert!(!passengers.fallen_over);
    }

    #[test]
    fn test_doors_animate_and_report_transitions() {
        let mut doors = TrainDoors::default();
        doors.open(true, false);
        let change = doors.update(0.1 * uc::S);
        assert_eq!(
            change,
            Some((
                DoorState {
                    left: false,
                    right: false
                },
                DoorState {
                    left: true,
                    right: false
                }
            ))
        );
        for _ in 0..20 {
            doors.update(0.1 * uc::S);
        }
        assert_eq!(doors.state_left, 1.0);
        doors.close(true, true);
        let mut closed_change = None;
        for _ in 0..30 {
            if let Some(change) = doors.update(0.1 * uc::S) {
                closed_change = Some(change);
            }
        }
        assert!(!doors.any_open());
        assert_eq!(
            closed_change,
            Some((
                DoorState {
                    left: true,
                    right: false
                },
                DoorState {
                    left: false,
                    right: false
                }
            ))
        );
    }

    fn boarding_station() -> Station {
        Station {
            stops: vec![StationStop {
                track_position: 100.0 * uc::M,
                forward_tolerance: 5.0 * uc::M,
                backward_tolerance: 5.0 * uc::M,
                cars: 0,
            }],
            open_left_doors: true,
            stop_time: 15.0 * uc::S,
            passenger_ratio: 1.0,
            ..Station::valid()
        }
    }

    #[test]
    fn test_station_stop_cycle() {
        let stations = vec![boarding_station()];
        let mut train = Train::valid();
        // place the front face at the stop point
        let offset = 100.0 * uc::M - train.front_position();
        for car in &mut train.cars {
            car.front_axle.follower.track_position += offset;
            car.rear_axle.follower.track_position += offset;
        }
        train.enter_station_zone(0);
        let mut now = si::Time::ZERO;
        let dt = 0.5 * uc::S;
        // standing at the platform; doors open and boarding begins
        let mut boarded = false;
        for _ in 0..10 {
            train.update_station(&stations, true, now);
            train.update_doors(dt);
            now += dt;
            if train.station_state == TrainStopState::Boarding {
                boarded = true;
                break;
            }
        }
        assert!(boarded);
        assert!(train.doors.anticipated_left);
        // mass picked up the boarded passengers
        assert!(train.cars[0].mass_current > train.cars[0].mass_empty);
        // wait out the dwell; doors close and the stop completes
        for _ in 0..100 {
            train.update_station(&stations, true, now);
            train.update_doors(dt);
            now += dt;
        }
        assert_eq!(train.station_state, TrainStopState::Completed);
        assert!(!train.doors.any_open());
    }

    #[test]
    fn test_pass_through_station_never_boards() {
        let mut stations = vec![boarding_station()];
        stations[0].stop_mode = crate::signal::StationStopMode::AllPass;
        let mut train = Train::valid();
        train.enter_station_zone(0);
        for i in 0..20 {
            train.update_station(&stations, true, i as f64 * 0.5 * uc::S);
        }
        assert_eq!(train.station_state, TrainStopState::Pending);
        assert!(!train.doors.any_open());
    }

    #[test]
    fn test_underail_clears_car_state() {
        let mut train = Train::valid();
        train.cars[0].derailed = true;
        train.cars[0].roll_due_to_topple = 0.3 * uc::RAD;
        train.cars[1].topples = true;
        train.underail();
        assert!(!train.is_derailed());
        assert_eq!(train.cars[0].roll_due_to_topple, si::Angle::ZERO);
        assert!(!train.cars[1].topples);
    }

    #[test]
    fn test_mass_update_scales_with_ratio() {
        let mut train = Train::valid();
        train.passengers.ratio = 1.0;
        train.update_mass_from_passenger_ratio();
        let area = train.cars[0].cabin_area.get::<si::square_meter>();
        let expected = train.cars[0].mass_empty + area.round() * 70.0 * uc::KG;
        assert!(almost_eq_uom(&train.cars[0].mass_current, &expected, None));
        train.passengers.ratio = 0.0;
        train.update_mass_from_passenger_ratio();
        assert_eq!(train.cars[0].mass_current, train.cars[0].mass_empty);
    }
}
