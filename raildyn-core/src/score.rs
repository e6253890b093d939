//! Performance scoring for the player's train. Counters accumulate while a
//! fault persists and convert to penalty points when it clears; station
//! stops earn arrival, punctuality, and stop-accuracy points.

use crate::imports::*;
use crate::signal::{Station, StationType};
use crate::train::{Train, TrainStopState};

const FACTOR_OPENED_DOORS: f64 = -10.0;
const FACTOR_OVERSPEED: f64 = -1.0;
const FACTOR_TOPPLING: f64 = -10.0;
const FACTOR_STATION_LATE: f64 = -1.0 / 3.0;
const FACTOR_STATION_STOP: f64 = -50.0;
const FACTOR_STATION_DEPARTURE: f64 = -1.5;
const VALUE_DERAILMENT: i32 = -1000;
const VALUE_RED_SIGNAL: i32 = -100;
const VALUE_STATION_PERFECT_TIME: i32 = 15;
const VALUE_STATION_PERFECT_STOP: i32 = 15;
const VALUE_PASSENGER_DISCOMFORT: i32 = -20;
pub const VALUE_STATION_ARRIVAL: i32 = 100;

/// Why points were awarded or deducted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreReason {
    Overspeed,
    PassedRedSignal,
    Toppling,
    Derailed,
    PassengerDiscomfort,
    DoorsOpened,
    ArrivedAtStation,
    PerfectTimeBonus,
    Late,
    PerfectStopBonus,
    Stop,
    PrematureDeparture,
}

/// One scoring entry in the log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub value: i32,
    pub reason: ScoreReason,
    pub time: si::Time,
}

/// Tracks the player's running score over a route.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTracker {
    pub value: i32,
    pub maximum: i32,
    #[serde(default)]
    opened_doors_counter: f64,
    #[serde(default)]
    overspeed_counter: f64,
    #[serde(default)]
    toppling_counter: f64,
    #[serde(default)]
    red_signal: bool,
    #[serde(default)]
    derailed: bool,
    /// The next station an arrival can be scored at.
    #[serde(default)]
    pub arrival_station: usize,
    #[serde(default)]
    pub departure_station: Option<usize>,
    #[serde(default)]
    passenger_timer: f64,
    #[serde(default)]
    pub log: Vec<ScoreEvent>,
}

impl ScoreTracker {
    /// The attainable maximum is the arrival award at every station the
    /// player stops at, or a single award when the route has none.
    pub fn new(stations: &[Station]) -> Self {
        let mut maximum = 0;
        for station in stations {
            if station.stops_at(true) && !station.stops.is_empty() {
                maximum += VALUE_STATION_ARRIVAL;
            }
        }
        if maximum <= 0 {
            maximum = VALUE_STATION_ARRIVAL;
        }
        Self {
            maximum,
            ..Default::default()
        }
    }

    fn add(&mut self, value: i32, reason: ScoreReason, time: si::Time) {
        self.value += value;
        if value != 0 {
            self.log.push(ScoreEvent {
                value,
                reason,
                time,
            });
        }
    }

    /// Scores one tick of the player train's state.
    pub fn update(&mut self, train: &Train, stations: &[Station], now: si::Time, dt: si::Time) {
        let dt_s = secs(dt);
        let speed = train.average_speed.get::<si::meter_per_second>();
        // doors opened away from a platform
        {
            let left_open = train.doors.state_left != 0.0;
            let right_open = train.doors.state_right != 0.0;
            let mut bad = left_open || right_open;
            if bad {
                if let Some(j) = train.station {
                    if !stations[j].stops.is_empty()
                        && speed.abs() < 0.1
                        && left_open == stations[j].open_left_doors
                        && right_open == stations[j].open_right_doors
                    {
                        bad = false;
                    }
                }
            }
            if bad {
                self.opened_doors_counter += (speed.abs() + 0.25) * dt_s;
            } else if self.opened_doors_counter != 0.0 {
                let x = (FACTOR_OPENED_DOORS * self.opened_doors_counter).ceil() as i32;
                self.add(x, ScoreReason::DoorsOpened, now);
                self.opened_doors_counter = 0.0;
            }
        }
        // overspeed
        {
            let limit = train
                .current_route_limit
                .min(train.current_section_limit)
                .get::<si::meter_per_second>();
            let a = speed.abs() - 1.0 / 3.6;
            if a > limit {
                self.overspeed_counter += (a - limit) * dt_s;
            } else if self.overspeed_counter != 0.0 {
                let x = (FACTOR_OVERSPEED * self.overspeed_counter).ceil() as i32;
                self.add(x, ScoreReason::Overspeed, now);
                self.overspeed_counter = 0.0;
            }
        }
        // toppling
        {
            let toppling = train.cars.iter().any(|car| car.topples);
            if toppling {
                self.toppling_counter += dt_s;
            } else if self.toppling_counter != 0.0 {
                let x = (FACTOR_TOPPLING * self.toppling_counter).ceil() as i32;
                self.add(x, ScoreReason::Toppling, now);
                self.toppling_counter = 0.0;
            }
        }
        // derailment wipes any positive score
        if !self.derailed && train.is_derailed() {
            let mut x = VALUE_DERAILMENT;
            if self.value > 0 {
                x -= self.value;
            }
            self.add(x, ScoreReason::Derailed, now);
            self.derailed = true;
        }
        // passing a red signal
        if train.current_section_limit == si::Velocity::ZERO {
            if !self.red_signal {
                self.add(VALUE_RED_SIGNAL, ScoreReason::PassedRedSignal, now);
                self.red_signal = true;
            }
        } else {
            self.red_signal = false;
        }
        // arrival
        if let Some(j) = train.station {
            if j < stations.len()
                && j >= self.arrival_station
                && train.station_state == TrainStopState::Boarding
            {
                if j == 0 || stations[j - 1].station_type != StationType::ChangeEnds {
                    self.add(VALUE_STATION_ARRIVAL, ScoreReason::ArrivedAtStation, now);
                    // punctuality
                    if let Some(arrival) = stations[j].arrival_time {
                        let d = secs(now) - secs(arrival);
                        if (-5.0..=0.0).contains(&d) {
                            self.add(VALUE_STATION_PERFECT_TIME, ScoreReason::PerfectTimeBonus, now);
                        } else if d > 0.0 {
                            let x = (FACTOR_STATION_LATE * (d - 1.0)).ceil() as i32;
                            self.add(x, ScoreReason::Late, now);
                        }
                    }
                    // stop accuracy
                    let p = stations[j].stop_index(train.cars.len());
                    if let Some(stop) = stations[j].stops.get(p) {
                        let d = train
                            .station_distance_to_stop_point
                            .get::<si::meter>();
                        let t = if d >= 0.0 {
                            stop.backward_tolerance.get::<si::meter>()
                        } else {
                            stop.forward_tolerance.get::<si::meter>()
                        };
                        let mut r = ((d * d + 1.0).sqrt() - 1.0) / ((t * t + 1.0).sqrt() - 1.0);
                        if r < 0.01 {
                            self.add(VALUE_STATION_PERFECT_STOP, ScoreReason::PerfectStopBonus, now);
                        } else {
                            r = (r.min(1.0) - 0.01) / 0.99;
                            let x = (FACTOR_STATION_STOP * r).ceil() as i32;
                            self.add(x, ScoreReason::Stop, now);
                        }
                    }
                }
                self.departure_station = Some(j);
                self.arrival_station = j + 1;
            }
        }
        // premature departure
        if let Some(j) = train.station {
            if j < stations.len() && Some(j) == self.departure_station {
                let departed = if stations[j].open_left_doors || stations[j].open_right_doors {
                    train.station_state == TrainStopState::Completed
                } else {
                    train.station_state != TrainStopState::Pending && speed.abs() > 1.5
                };
                if departed {
                    if let Some(departure) = train.station_departure_time {
                        let r = secs(departure) - secs(now);
                        if r > 0.0 {
                            let x = (FACTOR_STATION_DEPARTURE * r).ceil() as i32;
                            self.add(x, ScoreReason::PrematureDeparture, now);
                        }
                    }
                    self.departure_station = None;
                }
            }
        }
        // passenger discomfort, rate limited to once per five seconds
        if train.passengers.fallen_over && self.passenger_timer == 0.0 {
            self.add(VALUE_PASSENGER_DISCOMFORT, ScoreReason::PassengerDiscomfort, now);
            self.passenger_timer = 5.0;
        } else {
            self.passenger_timer -= dt_s;
            if self.passenger_timer <= 0.0 {
                self.passenger_timer = if train.passengers.fallen_over { 5.0 } else { 0.0 };
            }
        }
    }

    /// Writes the score log as CSV, one row per scoring event.
    pub fn write_log_csv<W: std::io::Write>(&self, writer: W) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for event in &self.log {
            writer.serialize(event)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_log_csv_file<P: AsRef<Path>>(&self, filepath: P) -> anyhow::Result<()> {
        let filepath = filepath.as_ref();
        let file = File::create(filepath)
            .with_context(|| format!("Could not create file: {filepath:?}"))?;
        self.write_log_csv(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::StationStop;

    fn stopping_station() -> Station {
        Station {
            arrival_time: Some(100.0 * uc::S),
            stops: vec![StationStop {
                track_position: 500.0 * uc::M,
                ..Default::default()
            }],
            ..Station::valid()
        }
    }

    #[test]
    fn test_maximum_counts_player_stops() {
        let mut pass_through = stopping_station();
        pass_through.stop_mode = crate::signal::StationStopMode::AllPass;
        let stations = vec![stopping_station(), pass_through, stopping_station()];
        let tracker = ScoreTracker::new(&stations);
        assert_eq!(tracker.maximum, 2 * VALUE_STATION_ARRIVAL);
        assert_eq!(ScoreTracker::new(&[]).maximum, VALUE_STATION_ARRIVAL);
    }

    #[test]
    fn test_red_signal_penalty_fires_once() {
        let stations = vec![stopping_station()];
        let mut tracker = ScoreTracker::new(&stations);
        let mut train = Train::valid();
        train.current_section_limit = si::Velocity::ZERO;
        let dt = 0.1 * uc::S;
        tracker.update(&train, &stations, si::Time::ZERO, dt);
        tracker.update(&train, &stations, dt, dt);
        assert_eq!(tracker.value, VALUE_RED_SIGNAL);
        // a new red section after release penalizes again
        train.current_section_limit = 20.0 * uc::MPS;
        tracker.update(&train, &stations, 2.0 * dt, dt);
        train.current_section_limit = si::Velocity::ZERO;
        tracker.update(&train, &stations, 3.0 * dt, dt);
        assert_eq!(tracker.value, 2 * VALUE_RED_SIGNAL);
    }

    #[test]
    fn test_overspeed_penalty_on_clearing() {
        let stations = vec![stopping_station()];
        let mut tracker = ScoreTracker::new(&stations);
        let mut train = Train::valid();
        train.current_section_limit = 10.0 * uc::MPS;
        train.average_speed = 20.0 * uc::MPS;
        let dt = 1.0 * uc::S;
        let mut now = si::Time::ZERO;
        for _ in 0..5 {
            tracker.update(&train, &stations, now, dt);
            now += dt;
        }
        // penalty only lands once the train is back under the limit
        assert_eq!(tracker.value, 0);
        train.average_speed = 5.0 * uc::MPS;
        tracker.update(&train, &stations, now, dt);
        assert!(tracker.value < 0);
        assert_eq!(tracker.log[0].reason, ScoreReason::Overspeed);
    }

    #[test]
    fn test_perfect_arrival_scores_bonuses() {
        let stations = vec![stopping_station()];
        let mut tracker = ScoreTracker::new(&stations);
        let mut train = Train::valid();
        train.station = Some(0);
        train.station_state = TrainStopState::Boarding;
        train.station_distance_to_stop_point = si::Length::ZERO;
        // on time and on the mark
        tracker.update(&train, &stations, 98.0 * uc::S, 0.1 * uc::S);
        assert_eq!(
            tracker.value,
            VALUE_STATION_ARRIVAL + VALUE_STATION_PERFECT_TIME + VALUE_STATION_PERFECT_STOP
        );
        assert_eq!(tracker.arrival_station, 1);
        // the same stop does not score twice
        tracker.update(&train, &stations, 99.0 * uc::S, 0.1 * uc::S);
        assert_eq!(tracker.arrival_station, 1);
        assert_eq!(
            tracker.value,
            VALUE_STATION_ARRIVAL + VALUE_STATION_PERFECT_TIME + VALUE_STATION_PERFECT_STOP
        );
    }

    #[test]
    fn test_late_arrival_and_bad_stop_penalized() {
        let stations = vec![stopping_station()];
        let mut tracker = ScoreTracker::new(&stations);
        let mut train = Train::valid();
        train.station = Some(0);
        train.station_state = TrainStopState::Boarding;
        train.station_distance_to_stop_point = 4.0 * uc::M;
        tracker.update(&train, &stations, 400.0 * uc::S, 0.1 * uc::S);
        let late = tracker
            .log
            .iter()
            .find(|event| event.reason == ScoreReason::Late);
        assert!(late.is_some_and(|event| event.value < 0));
        let stop = tracker
            .log
            .iter()
            .find(|event| event.reason == ScoreReason::Stop);
        assert!(stop.is_some_and(|event| event.value < 0));
    }

    #[test]
    fn test_derailment_wipes_positive_score() {
        let stations = vec![stopping_station()];
        let mut tracker = ScoreTracker::new(&stations);
        tracker.value = 130;
        let mut train = Train::valid();
        train.cars[0].derailed = true;
        tracker.update(&train, &stations, si::Time::ZERO, 0.1 * uc::S);
        assert_eq!(tracker.value, VALUE_DERAILMENT);
        // scored once
        tracker.update(&train, &stations, 0.1 * uc::S, 0.1 * uc::S);
        assert_eq!(tracker.value, VALUE_DERAILMENT);
    }

    #[test]
    fn test_passenger_discomfort_rate_limited() {
        let stations = vec![stopping_station()];
        let mut tracker = ScoreTracker::new(&stations);
        let mut train = Train::valid();
        train.passengers.fallen_over = true;
        let dt = 1.0 * uc::S;
        let mut now = si::Time::ZERO;
        for _ in 0..4 {
            tracker.update(&train, &stations, now, dt);
            now += dt;
        }
        assert_eq!(tracker.value, VALUE_PASSENGER_DISCOMFORT);
        // the timer re-arms only after the discomfort clears
        train.passengers.fallen_over = false;
        for _ in 0..6 {
            tracker.update(&train, &stations, now, dt);
            now += dt;
        }
        train.passengers.fallen_over = true;
        tracker.update(&train, &stations, now, dt);
        assert_eq!(tracker.value, 2 * VALUE_PASSENGER_DISCOMFORT);
    }

    #[test]
    fn test_log_csv_export() {
        let mut tracker = ScoreTracker::new(&[]);
        tracker.log = vec![
            ScoreEvent {
                value: -10,
                reason: ScoreReason::Overspeed,
                time: 12.0 * uc::S,
            },
            ScoreEvent {
                value: 100,
                reason: ScoreReason::ArrivedAtStation,
                time: 95.0 * uc::S,
            },
        ];
        let mut buffer = Vec::new();
        tracker.write_log_csv(&mut buffer).unwrap();
        let csv = String::from_utf8(buffer).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("value,reason,time"));
        assert_eq!(lines.next(), Some("-10,Overspeed,12.0"));
        assert!(lines.next().is_some_and(|line| line.starts_with("100,")));
    }
}
