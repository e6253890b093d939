use crate::imports::*;

/// One stopping point at a station. `cars` limits the stop to trains with
/// at most that many cars; zero means any length.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationStop {
    pub track_position: si::Length,
    pub forward_tolerance: si::Length,
    pub backward_tolerance: si::Length,
    #[serde(default)]
    pub cars: usize,
}

impl Default for StationStop {
    fn default() -> Self {
        Self {
            track_position: si::Length::ZERO,
            forward_tolerance: 5.0 * uc::M,
            backward_tolerance: 5.0 * uc::M,
            cars: 0,
        }
    }
}

impl ObjState for StationStop {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_fin(&mut errors, &self.track_position, "Stop track position");
        si_chk_num_gez(&mut errors, &self.forward_tolerance, "Forward tolerance");
        si_chk_num_gez(&mut errors, &self.backward_tolerance, "Backward tolerance");
        errors.make_err()
    }
}

/// Which trains a station stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationStopMode {
    #[default]
    AllStop,
    AllPass,
    PlayerStop,
    PlayerPass,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationType {
    #[default]
    Normal,
    /// The driver changes ends here; completing the stop jumps the train to
    /// the next station.
    ChangeEnds,
    Terminal,
}

/// A station along the route with its timetable entry and stop points.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    #[serde(default)]
    pub arrival_time: Option<si::Time>,
    #[serde(default)]
    pub departure_time: Option<si::Time>,
    #[serde(default)]
    pub stop_time: si::Time,
    #[serde(default)]
    pub stop_mode: StationStopMode,
    #[serde(default)]
    pub station_type: StationType,
    /// Hold the departure signal at red until the scheduled departure even
    /// for trains that would otherwise pass.
    #[serde(default)]
    pub force_stop_signal: bool,
    #[serde(default)]
    pub open_left_doors: bool,
    #[serde(default)]
    pub open_right_doors: bool,
    pub stops: Vec<StationStop>,
    #[serde(default)]
    pub passenger_ratio: f64,
    /// Where the station zone begins; also the placement point for trains
    /// introduced or jumped here.
    #[serde(default)]
    pub default_track_position: si::Length,
}

impl Station {
    /// The stop point a train of `cars` cars uses: the first stop that
    /// accepts the train's length, or the last stop when none does.
    pub fn stop_index(&self, cars: usize) -> usize {
        let mut j = None;
        for (i, stop) in self.stops.iter().enumerate().rev() {
            if cars <= stop.cars || stop.cars == 0 {
                j = Some(i);
            }
        }
        match j {
            Some(i) => i,
            None => self.stops.len().saturating_sub(1),
        }
    }

    pub fn stops_at(&self, is_player: bool) -> bool {
        if is_player {
            matches!(
                self.stop_mode,
                StationStopMode::AllStop | StationStopMode::PlayerStop
            )
        } else {
            matches!(
                self.stop_mode,
                StationStopMode::AllStop | StationStopMode::PlayerPass
            )
        }
    }

    /// The track interval a train counts as being at this station. Begins
    /// at the default track position and ends past the last stop point.
    pub fn zone(&self) -> (si::Length, si::Length) {
        let end = self
            .stops
            .iter()
            .map(|stop| stop.track_position + stop.forward_tolerance)
            .fold(self.default_track_position + 100.0 * uc::M, |a, b| {
                a.max(b)
            });
        (self.default_track_position, end)
    }
}

impl ObjState for Station {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_gez(&mut errors, &self.stop_time, "Stop time");
        chk_num_gez(&mut errors, self.passenger_ratio, "Passenger ratio");
        if let (Some(arrival), Some(departure)) = (self.arrival_time, self.departure_time) {
            if departure < arrival {
                errors.push(anyhow!("Departure time must not precede arrival time!"));
            }
        }
        validate_slice_real(&mut errors, &self.stops, "Stop");
        errors.make_err()
    }
}

impl Valid for Station {
    fn valid() -> Self {
        Self {
            name: "Station".to_string(),
            stop_time: 15.0 * uc::S,
            stops: vec![StationStop::default()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    impl Cases for Station {}

    #[test]
    fn check_station_cases() {
        check_cases!(Station);
    }

    #[test]
    fn test_stop_index_picks_shortest_matching_stop() {
        let station = Station {
            stops: vec![
                StationStop {
                    cars: 0,
                    ..Default::default()
                },
                StationStop {
                    cars: 8,
                    ..Default::default()
                },
                StationStop {
                    cars: 4,
                    ..Default::default()
                },
            ],
            ..Station::valid()
        };
        // the first stop accepting a 4-car train wins
        assert_eq!(station.stop_index(4), 0);
        let station = Station {
            stops: vec![
                StationStop {
                    cars: 4,
                    ..Default::default()
                },
                StationStop {
                    cars: 8,
                    ..Default::default()
                },
            ],
            ..Station::valid()
        };
        assert_eq!(station.stop_index(6), 1);
        // nothing matches: the last stop is used
        assert_eq!(station.stop_index(12), 1);
    }

    #[test]
    fn test_stops_at_mode_matrix() {
        let mut station = Station::valid();
        station.stop_mode = StationStopMode::AllStop;
        assert!(station.stops_at(true) && station.stops_at(false));
        station.stop_mode = StationStopMode::AllPass;
        assert!(!station.stops_at(true) && !station.stops_at(false));
        station.stop_mode = StationStopMode::PlayerStop;
        assert!(station.stops_at(true) && !station.stops_at(false));
        station.stop_mode = StationStopMode::PlayerPass;
        assert!(!station.stops_at(true) && station.stops_at(false));
    }
}
