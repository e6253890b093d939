//! The simulation arena: every train, section, and station of one route,
//! advanced together tick by tick. Trains and sections live in arenas with a
//! fake element at index zero so the newtype indices can use zero as NA.

use crate::imports::*;
use crate::plugin::{BeaconData, ElapseData, HandleSnapshot, PluginHost, SafetyPlugin, SignalData};
use crate::score::ScoreTracker;
use crate::signal::{
    get_plugin_signal, plugin_section_data, update_all_sections, Section, SectionIdx, Station,
    StationStopMode, SECTION_IDX_NA,
};
use crate::track::{AxleFollower, TrackProfile};
use crate::train::{AirBrakeHandleState, Car, Train, TrainIdx, TrainStatus};

use rayon::prelude::*;

/// Speed limit granted once a train that passed a red signal has come to a
/// stop under the driver's emergency brake.
const RELEASE_SPEED_LIMIT: si::Velocity = si::Velocity {
    dimension: uom::lib::marker::PhantomData,
    units: uom::lib::marker::PhantomData,
    value: 25.0 / 3.6,
};

fn unlimited_speed() -> si::Velocity {
    f64::INFINITY * uc::MPS
}

/// Physical constants and feature switches of a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimOptions {
    pub gravity: si::Acceleration,
    pub air_density: si::MassDensity,
    pub rail_gauge: si::Length,
    /// Sliding friction coefficient of a derailed car against the ground.
    pub ground_friction_coefficient: f64,
    /// Brake pipe pressure lost per second across a derailed coupling.
    pub brake_pipe_leak_rate: si::Pressure,
    /// Speed difference above which a collision derails the cars involved.
    pub critical_collision_speed_difference: si::Velocity,
    pub derailments: bool,
    pub collisions: bool,
    pub toppling: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            gravity: uc::ACC_GRAV,
            air_density: uc::rho_air(),
            rail_gauge: 1.435 * uc::M,
            ground_friction_coefficient: 0.5,
            brake_pipe_leak_rate: 500.0 * uc::KPA,
            critical_collision_speed_difference: 8.0 * uc::MPS,
            derailments: true,
            collisions: true,
            toppling: true,
        }
    }
}

impl ObjState for SimOptions {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_gtz(&mut errors, &self.gravity, "Gravity");
        si_chk_num_gtz(&mut errors, &self.air_density, "Air density");
        si_chk_num_gtz(&mut errors, &self.rail_gauge, "Rail gauge");
        chk_num_gez(
            &mut errors,
            self.ground_friction_coefficient,
            "Ground friction coefficient",
        );
        si_chk_num_gez(&mut errors, &self.brake_pipe_leak_rate, "Brake pipe leak rate");
        si_chk_num_gez(
            &mut errors,
            &self.critical_collision_speed_difference,
            "Critical collision speed difference",
        );
        errors.make_err()
    }
}

impl Valid for SimOptions {}

impl SerdeAPI for SimOptions {
    fn init(&mut self) -> anyhow::Result<()> {
        self.validate().map_err(|errors| anyhow!("{errors}"))
    }
}

/// Per-train results of the parallel tick that feed the serial phases.
struct TickOutput {
    jump: Option<usize>,
    prev_front: si::Length,
}

/// One route with its trains, signaling, stations, and score.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Simulation {
    pub options: SimOptions,
    pub track: TrackProfile,
    pub stations: Vec<Station>,
    /// Fake element at index zero; indices match [TrainIdx].
    pub trains: Vec<Train>,
    /// Safety plugin slot per train, aligned with `trains`. Not serialized;
    /// [SerdeAPI::init] restores empty slots.
    #[serde(skip)]
    pub plugins: Vec<Option<PluginHost>>,
    /// Fake element at index zero; sorted by track position from index one.
    pub sections: Vec<Section>,
    /// Track positions of buffer stops.
    #[serde(default)]
    pub buffer_track_positions: Vec<si::Length>,
    #[serde(default)]
    pub player_train: TrainIdx,
    #[serde(default)]
    pub now: si::Time,
    #[serde(default)]
    pub score: ScoreTracker,
}

impl Simulation {
    pub fn new(track: TrackProfile, stations: Vec<Station>, options: SimOptions) -> Self {
        let score = ScoreTracker::new(&stations);
        Self {
            options,
            track,
            stations,
            trains: vec![Train::default()],
            plugins: vec![None],
            sections: vec![Section::default()],
            buffer_track_positions: Vec::new(),
            player_train: Default::default(),
            now: si::Time::ZERO,
            score,
        }
    }

    /// Appends a section and links it into the chain.
    pub fn push_section(&mut self, mut section: Section) -> SectionIdx {
        let idx = SectionIdx::new(self.sections.len() as u32);
        if self.sections.len() > 1 {
            let prev = self.sections.len() - 1;
            section.previous_section = SectionIdx::new(prev as u32);
            self.sections[prev].next_section = idx;
        }
        self.sections.push(section);
        idx
    }

    pub fn add_train(&mut self, train: Train) -> TrainIdx {
        let idx = TrainIdx::new(self.trains.len() as u32);
        self.trains.push(train);
        self.plugins.push(None);
        idx
    }

    pub fn set_plugin(&mut self, train: TrainIdx, plugin: Box<dyn SafetyPlugin>) {
        self.plugins[train.idx()] = Some(PluginHost::new(plugin));
    }

    pub fn player(&self) -> Option<&Train> {
        if self.player_train.is_fake() {
            None
        } else {
            self.trains.get(self.player_train.idx())
        }
    }

    /// Lays a train's cars out along the track so its front face sits at
    /// `front`, initializing the axle followers from the profile.
    pub fn place_train(&mut self, train: TrainIdx, front: si::Length) -> anyhow::Result<()> {
        let track = &self.track;
        let train = &mut self.trains[train.idx()];
        let spacings: Vec<si::Length> = train
            .couplers
            .iter()
            .map(|coupler| 0.5 * (coupler.min_distance + coupler.max_distance))
            .collect();
        let mut cursor = front;
        for (i, car) in train.cars.iter_mut().enumerate() {
            let center = cursor - 0.5 * car.length;
            car.front_axle.follower = AxleFollower::new(track, center + car.front_axle.offset)?;
            car.rear_axle.follower = AxleFollower::new(track, center + car.rear_axle.offset)?;
            cursor -= car.length;
            if let Some(spacing) = spacings.get(i) {
                cursor -= *spacing;
            }
        }
        Ok(())
    }

    /// Settles occupancy and signal aspects after trains and sections have
    /// been set up. Called from [SerdeAPI::init] as well.
    pub fn initialize(&mut self) {
        update_all_sections(
            &mut self.sections,
            &self.trains,
            &self.stations,
            self.player_train,
            self.now,
        );
        self.sync_occupancy();
        update_all_sections(
            &mut self.sections,
            &self.trains,
            &self.stations,
            self.player_train,
            self.now,
        );
    }

    /// Advances the whole simulation by `dt`.
    pub fn step(&mut self, dt: si::Time) -> anyhow::Result<()> {
        ensure!(
            self.plugins.len() == self.trains.len(),
            "{}\nPlugin slots must match the train count!",
            format_dbg!()
        );
        let now = self.now + dt;
        self.introduce_pending_trains(now);
        let jumps = self.update_trains(now, dt)?;
        if self.options.collisions {
            self.resolve_collisions()?;
            self.resolve_buffer_collisions()?;
        }
        self.now = now;
        for (train, station) in jumps {
            self.jump_train(train, station)?;
        }
        self.sync_occupancy();
        update_all_sections(
            &mut self.sections,
            &self.trains,
            &self.stations,
            self.player_train,
            self.now,
        );
        if !self.player_train.is_fake()
            && self.trains[self.player_train.idx()].status.is_available()
        {
            self.score.update(
                &self.trains[self.player_train.idx()],
                &self.stations,
                self.now,
                dt,
            );
        }
        Ok(())
    }

    /// Removes a train from service and releases its block occupancy.
    pub fn dispose_train(&mut self, train: TrainIdx) {
        self.trains[train.idx()].status = TrainStatus::Disposed;
        for section in &mut self.sections {
            section.leave(train);
        }
        update_all_sections(
            &mut self.sections,
            &self.trains,
            &self.stations,
            self.player_train,
            self.now,
        );
    }

    /// Relocates a train to a station's stop point, as when the driver
    /// changes ends or the player jumps along the timetable.
    pub fn jump_train(&mut self, train_idx: TrainIdx, station_idx: usize) -> anyhow::Result<()> {
        ensure!(
            station_idx < self.stations.len(),
            "{}\nJump target station {} does not exist!",
            format_dbg!(),
            station_idx
        );
        let is_player = train_idx == self.player_train;
        let station = &self.stations[station_idx];
        let track = &self.track;
        let train = &mut self.trains[train_idx.idx()];
        ensure!(
            !train.cars.is_empty(),
            "{}\nCannot jump a train without cars!",
            format_dbg!()
        );
        let stop_position = match station.stops.get(station.stop_index(train.cars.len())) {
            Some(stop) => stop.track_position,
            None => station.default_track_position,
        };
        for car in &mut train.cars {
            car.speed = si::Velocity::ZERO;
            car.acceleration = si::Acceleration::ZERO;
            car.motor_acceleration_output = si::Acceleration::ZERO;
            car.perceived_speed = si::Velocity::ZERO;
        }
        train.average_speed = si::Velocity::ZERO;
        train.average_acceleration = si::Acceleration::ZERO;
        let delta = stop_position - train.front_position();
        for car in &mut train.cars {
            car.translate(track, delta)?;
        }
        train.underail();
        train.handles.apply_power(0);
        if !train.handles.emergency.driver {
            let maximum = train.handles.maximum_brake_notch;
            train.handles.apply_brake(maximum);
            train.handles.apply_air_brake_handle(AirBrakeHandleState::Service);
        }
        train.doors.close(true, true);
        if station.stops_at(is_player) {
            train
                .doors
                .open(station.open_left_doors, station.open_right_doors);
        }
        train.enter_station_zone(station_idx);
        if is_player {
            self.score.arrival_station = self.score.arrival_station.max(station_idx + 1);
            self.score.departure_station = Some(station_idx);
            if let Some(arrival) = station.arrival_time {
                self.now = arrival;
            } else if let Some(departure) = station.departure_time {
                self.now = departure - station.stop_time;
            }
        }
        Ok(())
    }

    /// Puts pending trains into service once their timetable slot has come
    /// and their block is free. The player train is introduced immediately.
    fn introduce_pending_trains(&mut self, now: si::Time) {
        for i in 1..self.trains.len() {
            if self.trains[i].status != TrainStatus::Pending {
                continue;
            }
            let forced = TrainIdx::new(i as u32) == self.player_train;
            let mut due = si::Time::ZERO;
            for station in &self.stations {
                if matches!(
                    station.stop_mode,
                    StationStopMode::AllStop | StationStopMode::PlayerPass
                ) {
                    due = match (station.arrival_time, station.departure_time) {
                        (Some(arrival), _) => arrival,
                        (None, Some(departure)) => departure - station.stop_time,
                        (None, None) => si::Time::ZERO,
                    };
                    break;
                }
            }
            due -= self.trains[i].timetable_delta;
            if forced || now >= due {
                let free = match self.section_at(self.trains[i].front_position()) {
                    Some(s) => self.sections[s].is_free(&self.trains),
                    None => true,
                };
                if forced || free {
                    self.trains[i].status = TrainStatus::Available;
                }
            }
        }
    }

    /// Runs the per-train tick in parallel, then the safety plugins, which
    /// need a view of every train, in series. Returns the queued
    /// change-ends jumps.
    fn update_trains(
        &mut self,
        now: si::Time,
        dt: si::Time,
    ) -> anyhow::Result<Vec<(TrainIdx, usize)>> {
        let track = &self.track;
        let options = &self.options;
        let stations = &self.stations;
        let player = self.player_train;
        let outputs: Vec<Option<TickOutput>> = self
            .trains
            .par_iter_mut()
            .zip(self.plugins.par_iter_mut())
            .enumerate()
            .map(|(i, (train, plugin))| {
                if i == 0 || !train.status.is_available() {
                    return Ok(None);
                }
                let is_player = TrainIdx::new(i as u32) == player;
                let prev_front = train.front_position();
                train.move_cars(track, options, dt)?;
                let jump = train.update_station(stations, is_player, now);
                if let Some((old, new)) = train.update_doors(dt) {
                    if let Some(host) = plugin.as_mut() {
                        host.door_change(old, new);
                    }
                }
                // without an active plugin the driver's positions pass
                // straight through to the safety layer
                let plugin_active = plugin.as_ref().is_some_and(|host| host.is_active());
                if !plugin_active {
                    train.handles.copy_driver_to_safety();
                }
                train.handles.update_delayed(now);
                train.update_speeds(track, options, now, dt)?;
                train.update_passengers(dt);
                // a train stopped under the emergency brake behind a passed
                // red signal may proceed at restricted speed
                if train.current_section_limit == si::Velocity::ZERO
                    && train.handles.emergency.driver
                    && train.average_speed.abs() < 0.03 * uc::MPS
                {
                    train.current_section_limit = RELEASE_SPEED_LIMIT;
                }
                Ok(Some(TickOutput { jump, prev_front }))
            })
            .collect::<anyhow::Result<Vec<Option<TickOutput>>>>()?;
        let mut jumps = Vec::new();
        let mut prev_fronts: Vec<Option<si::Length>> = vec![None; self.trains.len()];
        for (i, output) in outputs.into_iter().enumerate() {
            if let Some(output) = output {
                if let Some(station) = output.jump {
                    jumps.push((TrainIdx::new(i as u32), station));
                }
                prev_fronts[i] = Some(output.prev_front);
            }
        }
        for i in 1..self.trains.len() {
            let Some(prev_front) = prev_fronts[i] else {
                continue;
            };
            if !self.plugins[i].as_ref().is_some_and(|host| host.is_active()) {
                continue;
            }
            let idx = TrainIdx::new(i as u32);
            let signals = plugin_section_data(&self.sections, &self.trains, idx);
            let beacons: Vec<BeaconData> = self
                .track
                .beacons_crossed(prev_front, self.trains[i].front_position())
                .iter()
                .map(|beacon| BeaconData {
                    kind: beacon.kind,
                    data: beacon.data,
                    signal: if beacon.section.is_fake() {
                        SignalData {
                            aspect: -1,
                            distance: f64::INFINITY * uc::M,
                        }
                    } else {
                        get_plugin_signal(
                            &self.sections,
                            &self.trains,
                            idx,
                            beacon.section.idx(),
                        )
                    },
                })
                .collect();
            let data = self.elapse_data(i, now, dt);
            let Some(host) = self.plugins[i].as_mut() else {
                continue;
            };
            host.set_signals(&signals);
            for beacon in &beacons {
                host.set_beacon(beacon);
            }
            let train = &mut self.trains[i];
            train.handles.copy_driver_to_safety();
            host.elapse(&data, &mut train.handles);
        }
        Ok(jumps)
    }

    fn elapse_data(&self, i: usize, now: si::Time, dt: si::Time) -> ElapseData {
        let train = &self.trains[i];
        let car = &train.cars[train.driver_car];
        ElapseData {
            location: train.front_position(),
            speed: car.perceived_speed,
            brake_pipe_pressure: car.air_brake.brake_pipe,
            brake_cylinder_pressure: car.air_brake.brake_cylinder,
            main_reservoir_pressure: car.air_brake.main_reservoir,
            handles: HandleSnapshot {
                reverser: train.handles.reverser_driver,
                power_notch: train.handles.power_notch.driver,
                brake_notch: train.handles.brake_notch.driver,
                const_speed: train.handles.const_speed,
            },
            doors: train.doors.state(),
            total_time: now,
            elapsed_time: dt,
        }
    }

    /// Checks every pair of trains for overlap and lets the later train
    /// shunt the one it ran into.
    fn resolve_collisions(&mut self) -> anyhow::Result<()> {
        let track = &self.track;
        let options = &self.options;
        let trains = &mut self.trains;
        for i in 1..trains.len() {
            if !trains[i].status.is_available() {
                continue;
            }
            for j in (i + 1)..trains.len() {
                if !trains[j].status.is_available() {
                    continue;
                }
                let a = trains[i].front_position();
                let b = trains[i].rear_position();
                let c = trains[j].front_position();
                let d = trains[j].rear_position();
                if a > d && b < c {
                    let (ti, tj) = two_trains_mut(trains, i, j);
                    if a > c {
                        collide_trains(ti, tj, c - b, track, options)?;
                    } else {
                        collide_trains(tj, ti, a - d, track, options)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops the player train dead against a buffer stop it has run into.
    fn resolve_buffer_collisions(&mut self) -> anyhow::Result<()> {
        if self.player_train.is_fake() {
            return Ok(());
        }
        let track = &self.track;
        let derailments = self.options.derailments;
        let critical = self.options.critical_collision_speed_difference;
        let train = &mut self.trains[self.player_train.idx()];
        if !train.status.is_available() || train.cars.is_empty() {
            return Ok(());
        }
        for buffer in &self.buffer_track_positions {
            let a = train.front_position() + 0.0001 * uc::M;
            let b = train.rear_position() - 0.0001 * uc::M;
            if a > *buffer && b < *buffer {
                let da = a - *buffer;
                let db = *buffer - b;
                if da < db {
                    // hit front-on
                    train.cars[0].translate(track, -da)?;
                    if derailments && train.cars[0].speed.abs() > critical {
                        train.cars[0].derailed = true;
                    }
                    train.cars[0].speed = si::Velocity::ZERO;
                    for h in 1..train.cars.len() {
                        let gap = train.cars[h - 1].rear_position()
                            - train.cars[h].front_position()
                            - train.couplers[h - 1].min_distance;
                        if gap < si::Length::ZERO {
                            train.cars[h].translate(track, gap - 0.0001 * uc::M)?;
                            if derailments && train.cars[h].speed.abs() > critical {
                                train.cars[h].derailed = true;
                            }
                            train.cars[h].speed = si::Velocity::ZERO;
                        }
                    }
                } else {
                    // backed into the buffer
                    let last = train.cars.len() - 1;
                    train.cars[last].translate(track, db)?;
                    if derailments && train.cars[last].speed.abs() > critical {
                        train.cars[last].derailed = true;
                    }
                    train.cars[last].speed = si::Velocity::ZERO;
                    for h in (0..last).rev() {
                        let gap = train.cars[h].rear_position()
                            - train.cars[h + 1].front_position()
                            - train.couplers[h].min_distance;
                        if gap < si::Length::ZERO {
                            train.cars[h].translate(track, -gap + 0.0001 * uc::M)?;
                            if derailments && train.cars[h].speed.abs() > critical {
                                train.cars[h].derailed = true;
                            }
                            train.cars[h].speed = si::Velocity::ZERO;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Rebuilds section occupancy and station-zone assignment from the train
    /// positions. The section speed limit a train obeys is picked up on the
    /// tick it crosses into a new section, from the aspect the section
    /// showed before occupancy is re-rendered.
    fn sync_occupancy(&mut self) {
        for section in &mut self.sections {
            section.trains.clear();
        }
        let section_count = self.sections.len();
        for i in 1..self.trains.len() {
            let idx = TrainIdx::new(i as u32);
            if !matches!(
                self.trains[i].status,
                TrainStatus::Available | TrainStatus::Bogus
            ) {
                continue;
            }
            let front = self.trains[i].front_position();
            let rear = self.trains[i].rear_position();
            for s in 1..section_count {
                let start = self.sections[s].track_position;
                let end = if s + 1 < section_count {
                    self.sections[s + 1].track_position
                } else {
                    f64::INFINITY * uc::M
                };
                if front >= start && rear < end {
                    self.sections[s].enter(idx);
                }
            }
            let new_section = match self.section_at(front) {
                Some(s) => SectionIdx::new(s as u32),
                None => SECTION_IDX_NA,
            };
            if new_section != self.trains[i].current_section {
                let limit = if new_section.is_fake() {
                    unlimited_speed()
                } else {
                    let section = &self.sections[new_section.idx()];
                    match section.aspects.get(section.current_aspect) {
                        Some(aspect) => aspect.speed_limit,
                        None => unlimited_speed(),
                    }
                };
                self.trains[i].current_section_limit = limit;
                self.trains[i].current_section = new_section;
            }
            if self.trains[i].status.is_available() {
                let mut in_zone = None;
                for (k, station) in self.stations.iter().enumerate() {
                    let (start, end) = station.zone();
                    if front >= start && front <= end {
                        in_zone = Some(k);
                        break;
                    }
                }
                match in_zone {
                    Some(k) => self.trains[i].enter_station_zone(k),
                    None => {
                        if self.trains[i].station.is_some() {
                            self.trains[i].leave_station_zone();
                        }
                    }
                }
            }
        }
    }

    /// Index of the section containing `position`, or `None` ahead of the
    /// first section.
    fn section_at(&self, position: si::Length) -> Option<usize> {
        let mut found = None;
        for (i, section) in self.sections.iter().enumerate().skip(1) {
            if section.track_position <= position {
                found = Some(i);
            } else {
                break;
            }
        }
        found
    }
}

/// Disjoint mutable borrows of two trains, requires `i < j`.
fn two_trains_mut(trains: &mut [Train], i: usize, j: usize) -> (&mut Train, &mut Train) {
    let (left, right) = trains.split_at_mut(j);
    (&mut left[i], &mut right[0])
}

/// Merges the momentum of the two contact cars, separates the trains by the
/// overlap, and propagates the shunt through both consists.
fn collide_trains(
    leader: &mut Train,
    follower: &mut Train,
    overlap: si::Length,
    track: &TrackProfile,
    options: &SimOptions,
) -> anyhow::Result<()> {
    let k = leader.cars.len() - 1;
    if leader.cars[k].speed >= follower.cars[0].speed {
        return Ok(());
    }
    let v = (follower.cars[0].speed - leader.cars[k].speed).get::<si::meter_per_second>();
    let m_leader = leader.cars[k].mass_current.get::<si::kilogram>();
    let m_follower = follower.cars[0].mass_current.get::<si::kilogram>();
    let merged = (leader.cars[k].speed.get::<si::meter_per_second>() * m_leader
        + follower.cars[0].speed.get::<si::meter_per_second>() * m_follower)
        / (m_leader + m_follower)
        * uc::MPS;
    leader.cars[k].speed = merged;
    follower.cars[0].speed = merged;
    log::debug!(
        "train collision at {v:.1} m/s speed difference, {:.2} m overlap",
        overlap.get::<si::meter>()
    );
    let e = 0.5 * overlap + 0.0001 * uc::M;
    leader.cars[k].translate(track, e)?;
    follower.cars[0].translate(track, -e)?;
    if options.derailments {
        let critical = options
            .critical_collision_speed_difference
            .get::<si::meter_per_second>();
        let f = 2.0 / (m_leader + m_follower);
        if v * m_follower * f > critical {
            leader.cars[k].derailed = true;
        }
        if v * m_leader * f > critical {
            follower.cars[0].derailed = true;
        }
    }
    ripple_leader(leader, v, track, options)?;
    ripple_follower(follower, v, track, options)?;
    Ok(())
}

/// Restores coupler minimums ahead of a shunted rear car, passing the
/// contact speed forward through the consist.
fn ripple_leader(
    train: &mut Train,
    v: f64,
    track: &TrackProfile,
    options: &SimOptions,
) -> anyhow::Result<()> {
    for h in (0..train.cars.len().saturating_sub(1)).rev() {
        let gap = train.cars[h].rear_position()
            - train.cars[h + 1].front_position()
            - train.couplers[h].min_distance;
        if gap < si::Length::ZERO {
            train.cars[h].translate(track, -gap + 0.0001 * uc::M)?;
            if options.derailments {
                derail_pair(&mut train.cars, h + 1, h, v, options);
            }
            train.cars[h].speed = train.cars[h + 1].speed;
        }
    }
    Ok(())
}

/// Restores coupler minimums behind a shunted front car, passing the contact
/// speed rearward through the consist.
fn ripple_follower(
    train: &mut Train,
    v: f64,
    track: &TrackProfile,
    options: &SimOptions,
) -> anyhow::Result<()> {
    for h in 1..train.cars.len() {
        let gap = train.cars[h - 1].rear_position()
            - train.cars[h].front_position()
            - train.couplers[h - 1].min_distance;
        if gap < si::Length::ZERO {
            train.cars[h].translate(track, gap - 0.0001 * uc::M)?;
            if options.derailments {
                derail_pair(&mut train.cars, h - 1, h, v, options);
            }
            train.cars[h].speed = train.cars[h - 1].speed;
        }
    }
    Ok(())
}

/// Derails either car of a shunted coupling whose share of the contact
/// speed difference exceeds the critical value.
fn derail_pair(cars: &mut [Car], first: usize, second: usize, v: f64, options: &SimOptions) {
    let critical = options
        .critical_collision_speed_difference
        .get::<si::meter_per_second>();
    let f = 2.0 / (cars[first].mass_current + cars[second].mass_current).get::<si::kilogram>();
    if v * cars[first].mass_current.get::<si::kilogram>() * f > critical {
        cars[first].derailed = true;
    }
    if v * cars[second].mass_current.get::<si::kilogram>() * f > critical {
        cars[second].derailed = true;
    }
}

impl ObjState for Simulation {
    fn is_fake(&self) -> bool {
        self.track.is_fake()
    }
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        early_fake_ok!(self);
        validate_field_real(&mut errors, &self.options, "Options");
        validate_field_real(&mut errors, &self.track, "Track");
        validate_slice_real(&mut errors, &self.stations, "Station");
        match self.trains.first() {
            Some(train) if train.is_fake() => {}
            _ => errors.push(anyhow!("Train 0 must be the fake placeholder!")),
        }
        if self.trains.len() > 1 {
            validate_slice_real(&mut errors, &self.trains[1..], "Train");
        }
        if self.plugins.len() != self.trains.len() {
            errors.push(anyhow!("Plugin slots must match the train count!"));
        }
        match self.sections.first() {
            Some(section) if section.is_fake() => {}
            _ => errors.push(anyhow!("Section 0 must be the fake placeholder!")),
        }
        if self.sections.len() > 1 {
            validate_slice_real(&mut errors, &self.sections[1..], "Section");
            for pair in self.sections[1..].windows(2) {
                if pair[0].track_position > pair[1].track_position {
                    errors.push(anyhow!("Sections must be sorted by track position!"));
                }
            }
        }
        if self.player_train.idx() >= self.trains.len() {
            errors.push(anyhow!("Player train index must name an existing train!"));
        }
        for position in &self.buffer_track_positions {
            si_chk_num_fin(&mut errors, position, "Buffer track position");
        }
        si_chk_num_fin(&mut errors, &self.now, "Clock");
        errors.make_err()
    }
}

impl Valid for Simulation {
    fn valid() -> Self {
        let mut sim = Simulation::new(
            TrackProfile::valid(),
            vec![Station::valid()],
            SimOptions::default(),
        );
        for i in 1..=3_u32 {
            sim.push_section(Section {
                track_position: (i as f64) * 500.0 * uc::M,
                ..Section::valid()
            });
        }
        let player = sim.add_train(Train::valid());
        sim.player_train = player;
        sim
    }
}

impl SerdeAPI for Simulation {
    fn init(&mut self) -> anyhow::Result<()> {
        self.plugins.resize_with(self.trains.len(), || None);
        self.validate().map_err(|errors| anyhow!("{errors}"))?;
        self.initialize();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::HandleCommand;
    use crate::signal::StationStop;
    use crate::testing::*;
    use crate::track::TrackPoint;

    impl Cases for SimOptions {}
    impl Cases for Simulation {
        fn fake_cases() -> Vec<Self> {
            vec![Self::default()]
        }
    }

    #[test]
    fn check_sim_cases() {
        check_cases!(SimOptions);
        check_cases!(Simulation);
    }

    fn flat_track(length: f64) -> TrackProfile {
        TrackProfile {
            points: vec![
                TrackPoint::default(),
                TrackPoint {
                    offset: length * uc::M,
                    ..TrackPoint::default()
                },
            ],
            beacons: Vec::new(),
        }
    }

    /// `n` chained sections `spacing` meters apart, no stations.
    fn chained_sim(n: u32, spacing: f64) -> Simulation {
        let mut sim = Simulation::new(
            flat_track(n as f64 * spacing + 5000.0),
            Vec::new(),
            SimOptions::default(),
        );
        for i in 1..=n {
            sim.push_section(Section {
                track_position: (i as f64) * spacing * uc::M,
                ..Section::valid()
            });
        }
        sim
    }

    fn moving_sim() -> Simulation {
        let mut sim = chained_sim(4, 500.0);
        let player = sim.add_train(Train::valid());
        sim.player_train = player;
        sim.place_train(player, 100.0 * uc::M).unwrap();
        sim.initialize();
        sim
    }

    #[test]
    fn test_step_advances_clock_and_moves_cars() {
        let mut sim = moving_sim();
        for car in &mut sim.trains[1].cars {
            car.speed = 10.0 * uc::MPS;
        }
        let start = sim.trains[1].front_position();
        for _ in 0..10 {
            sim.step(0.1 * uc::S).unwrap();
        }
        assert!(almost_eq_uom(&sim.now, &(1.0 * uc::S), None));
        // coasting covers roughly a second of travel at initial speed
        assert!(sim.trains[1].front_position() > start + 5.0 * uc::M);
        assert!(sim.trains[1].average_speed > 9.0 * uc::MPS);
    }

    #[test]
    fn test_occupancy_sync_tracks_front() {
        let mut sim = moving_sim();
        sim.place_train(TrainIdx::new(1), 700.0 * uc::M).unwrap();
        sim.initialize();
        let idx = TrainIdx::new(1);
        assert!(sim.sections[1].exists(idx));
        assert!(!sim.sections[2].exists(idx));
        assert_eq!(sim.trains[1].current_section, SectionIdx::new(1));
        // the block was clear when the train entered it
        assert!(sim.trains[1].current_section_limit > 100.0 * uc::MPS);
        // the occupied block shows red behind the train
        assert_eq!(sim.sections[1].current_aspect_number(), 0);
    }

    #[test]
    fn test_pending_train_waits_for_schedule_and_block() {
        let stations = vec![Station {
            arrival_time: Some(60.0 * uc::S),
            default_track_position: 1800.0 * uc::M,
            stops: vec![StationStop {
                track_position: 1900.0 * uc::M,
                ..Default::default()
            }],
            ..Station::valid()
        }];
        let mut sim = Simulation::new(flat_track(5000.0), stations, SimOptions::default());
        for i in 1..=3_u32 {
            sim.push_section(Section {
                track_position: (i as f64) * 500.0 * uc::M,
                ..Section::valid()
            });
        }
        let pending = sim.add_train(Train::valid());
        sim.trains[pending.idx()].status = TrainStatus::Pending;
        let blocker = sim.add_train(Train::valid());
        sim.place_train(pending, 700.0 * uc::M).unwrap();
        sim.place_train(blocker, 950.0 * uc::M).unwrap();
        sim.initialize();
        // before the timetable slot
        sim.step(0.1 * uc::S).unwrap();
        assert_eq!(sim.trains[pending.idx()].status, TrainStatus::Pending);
        // past the slot, but the block is occupied
        sim.now = 60.0 * uc::S;
        sim.step(0.1 * uc::S).unwrap();
        assert_eq!(sim.trains[pending.idx()].status, TrainStatus::Pending);
        // block released
        sim.dispose_train(blocker);
        sim.step(0.1 * uc::S).unwrap();
        assert_eq!(sim.trains[pending.idx()].status, TrainStatus::Available);
    }

    /// Commands the emergency brake whenever a red signal is within range.
    #[derive(Default)]
    struct StopAtRed {
        red_distance: Option<si::Length>,
    }

    impl SafetyPlugin for StopAtRed {
        fn elapse(&mut self, _data: &ElapseData) -> anyhow::Result<HandleCommand> {
            let brake = self.red_distance.is_some_and(|d| d < 500.0 * uc::M);
            Ok(HandleCommand {
                emergency: Some(brake),
                ..Default::default()
            })
        }
        fn set_signals(&mut self, signals: &[SignalData]) {
            self.red_distance = signals
                .iter()
                .find(|signal| signal.aspect == 0)
                .map(|signal| signal.distance);
        }
    }

    #[test]
    fn test_plugin_stops_train_before_red_section() {
        let mut sim = chained_sim(6, 400.0);
        let player = sim.add_train(Train::valid());
        sim.player_train = player;
        sim.place_train(player, 100.0 * uc::M).unwrap();
        for car in &mut sim.trains[player.idx()].cars {
            car.speed = 10.0 * uc::MPS;
            car.perceived_speed = 10.0 * uc::MPS;
        }
        let blocker = sim.add_train(Train::valid());
        sim.place_train(blocker, 2500.0 * uc::M).unwrap();
        sim.set_plugin(player, Box::new(StopAtRed::default()));
        sim.initialize();
        for _ in 0..2500 {
            sim.step(0.1 * uc::S).unwrap();
        }
        let train = &sim.trains[player.idx()];
        // stopped short of the occupied block at 2400 m
        assert!(train.average_speed.abs() < 0.01 * uc::MPS);
        assert!(train.front_position() < 2400.0 * uc::M);
        assert!(train.front_position() > 1000.0 * uc::M);
        assert!(train.handles.emergency.actual);
        assert!(!train.is_derailed());
    }

    #[test]
    fn test_red_section_stop_from_short_approach() {
        // the valid consist's curves peak at 1.0 m/s^2; the red block starts
        // only 200 m ahead of the moving train
        let mut sim = chained_sim(4, 400.0);
        let player = sim.add_train(Train::valid());
        sim.player_train = player;
        sim.place_train(player, 600.0 * uc::M).unwrap();
        for car in &mut sim.trains[player.idx()].cars {
            car.speed = 10.0 * uc::MPS;
            car.perceived_speed = 10.0 * uc::MPS;
        }
        let blocker = sim.add_train(Train::valid());
        sim.place_train(blocker, 1000.0 * uc::M).unwrap();
        sim.set_plugin(player, Box::new(StopAtRed::default()));
        sim.initialize();
        for _ in 0..600 {
            sim.step(0.1 * uc::S).unwrap();
        }
        let train = &sim.trains[player.idx()];
        assert!(train.average_speed.abs() < 0.01 * uc::MPS);
        assert!(train.front_position() < 800.0 * uc::M);
        assert!(train.front_position() > 620.0 * uc::M);
        assert!(!train.is_derailed());
    }

    #[test]
    fn test_collision_merges_speeds_and_derails() {
        let mut sim = chained_sim(2, 500.0);
        let leader = sim.add_train(Train::valid());
        let follower = sim.add_train(Train::valid());
        sim.place_train(leader, 300.0 * uc::M).unwrap();
        sim.place_train(follower, 270.0 * uc::M).unwrap();
        for car in &mut sim.trains[follower.idx()].cars {
            car.speed = 10.0 * uc::MPS;
        }
        sim.resolve_collisions().unwrap();
        // equal masses split the speed difference evenly
        assert!(almost_eq_uom(
            &sim.trains[leader.idx()].cars[1].speed,
            &(5.0 * uc::MPS),
            None
        ));
        assert!(almost_eq_uom(
            &sim.trains[follower.idx()].cars[0].speed,
            &(5.0 * uc::MPS),
            None
        ));
        // ten meters per second over the critical difference derails both
        assert!(sim.trains[leader.idx()].cars[1].derailed);
        assert!(sim.trains[follower.idx()].cars[0].derailed);
        // the trains no longer overlap
        assert!(
            sim.trains[follower.idx()].front_position()
                <= sim.trains[leader.idx()].rear_position()
        );
    }

    #[test]
    fn test_slow_collision_does_not_derail() {
        let mut sim = chained_sim(2, 500.0);
        let leader = sim.add_train(Train::valid());
        let follower = sim.add_train(Train::valid());
        sim.place_train(leader, 300.0 * uc::M).unwrap();
        sim.place_train(follower, 270.0 * uc::M).unwrap();
        for car in &mut sim.trains[follower.idx()].cars {
            car.speed = 2.0 * uc::MPS;
        }
        sim.resolve_collisions().unwrap();
        assert!(!sim.trains[leader.idx()].is_derailed());
        assert!(!sim.trains[follower.idx()].is_derailed());
        assert!(almost_eq_uom(
            &sim.trains[leader.idx()].cars[1].speed,
            &(1.0 * uc::MPS),
            None
        ));
    }

    #[test]
    fn test_buffer_stop_halts_player() {
        let mut sim = chained_sim(2, 500.0);
        sim.buffer_track_positions = vec![800.0 * uc::M];
        let player = sim.add_train(Train::valid());
        sim.player_train = player;
        sim.place_train(player, 810.0 * uc::M).unwrap();
        for car in &mut sim.trains[player.idx()].cars {
            car.speed = 2.0 * uc::MPS;
        }
        sim.resolve_buffer_collisions().unwrap();
        let train = &sim.trains[player.idx()];
        assert!(train.front_position() < 800.01 * uc::M);
        assert!(train.front_position() > 799.0 * uc::M);
        for car in &train.cars {
            assert_eq!(car.speed, si::Velocity::ZERO);
            assert!(!car.derailed);
        }
    }

    #[test]
    fn test_jump_train_relocates_and_scores() {
        let stations = vec![Station {
            arrival_time: Some(120.0 * uc::S),
            departure_time: Some(150.0 * uc::S),
            default_track_position: 1100.0 * uc::M,
            open_left_doors: true,
            stops: vec![StationStop {
                track_position: 1200.0 * uc::M,
                ..Default::default()
            }],
            ..Station::valid()
        }];
        let mut sim = Simulation::new(flat_track(5000.0), stations, SimOptions::default());
        for i in 1..=3_u32 {
            sim.push_section(Section {
                track_position: (i as f64) * 500.0 * uc::M,
                ..Section::valid()
            });
        }
        let player = sim.add_train(Train::valid());
        sim.player_train = player;
        sim.place_train(player, 100.0 * uc::M).unwrap();
        sim.initialize();
        sim.jump_train(player, 0).unwrap();
        let train = &sim.trains[player.idx()];
        assert!(almost_eq_uom(
            &train.front_position(),
            &(1200.0 * uc::M),
            None
        ));
        assert_eq!(train.average_speed, si::Velocity::ZERO);
        assert_eq!(train.station, Some(0));
        assert!(train.doors.anticipated_left);
        assert_eq!(
            train.handles.brake_notch.driver,
            train.handles.maximum_brake_notch
        );
        assert!(almost_eq_uom(&sim.now, &(120.0 * uc::S), None));
        assert_eq!(sim.score.arrival_station, 1);
        assert_eq!(sim.score.departure_station, Some(0));
    }

    #[test]
    fn test_emergency_stop_releases_section_limit() {
        let mut sim = moving_sim();
        sim.trains[1].current_section_limit = si::Velocity::ZERO;
        sim.trains[1].handles.apply_emergency(true);
        sim.step(0.1 * uc::S).unwrap();
        assert!(almost_eq_uom(
            &sim.trains[1].current_section_limit,
            &(25.0 * uc::KPH),
            None
        ));
    }

    #[test]
    fn test_simulation_yaml_round_trip() {
        let sim = Simulation::valid();
        let yaml = sim.to_yaml().unwrap();
        let restored = Simulation::from_yaml(yaml).unwrap();
        assert_eq!(restored.trains.len(), sim.trains.len());
        assert_eq!(restored.plugins.len(), restored.trains.len());
        assert_eq!(restored.sections.len(), sim.sections.len());
        assert_eq!(restored.player_train, sim.player_train);
    }
}
