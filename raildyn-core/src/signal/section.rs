use crate::imports::*;
use crate::plugin::SignalData;
use crate::signal::Station;
use crate::train::{Train, TrainIdx, TRAIN_IDX_NA};

use serde::{de::Visitor, Deserializer, Serializer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SectionIdx {
    idx: u32,
}
pub const SECTION_IDX_NA: SectionIdx = SectionIdx { idx: 0 };

impl SectionIdx {
    pub fn new(idx: u32) -> Self {
        Self { idx }
    }
    pub fn idx(&self) -> usize {
        self.idx.idx()
    }
}

impl std::hash::Hash for SectionIdx {
    fn hash<H: std::hash::Hasher>(&self, hasher: &mut H) {
        hasher.write_u32(self.idx);
    }
}

impl fmt::Display for SectionIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.idx)
    }
}

impl Serialize for SectionIdx {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(self.idx)
    }
}

impl<'de> Deserialize<'de> for SectionIdx {
    fn deserialize<D>(deserializer: D) -> Result<SectionIdx, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SectionIdxVisitor;
        impl<'de> Visitor<'de> for SectionIdxVisitor {
            type Value = SectionIdx;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("integer")
            }

            fn visit_u32<E>(self, v: u32) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(SectionIdx::new(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v <= u64::from(u32::MAX) {
                    Ok(SectionIdx::new(v as u32))
                } else {
                    Err(E::custom(format!("u32 out of range: {v}")))
                }
            }
        }

        deserializer.deserialize_u32(SectionIdxVisitor)
    }
}

impl Valid for SectionIdx {
    fn valid() -> Self {
        Self { idx: 1 }
    }
}

impl ObjState for SectionIdx {
    fn is_fake(&self) -> bool {
        self.idx == 0
    }
}

/// How a section picks its aspect from the state ahead.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionType {
    /// The aspect is the lowest own aspect whose number exceeds the next
    /// section's current aspect number.
    #[default]
    ValueBased,
    /// The aspect index equals the count of free sections ahead.
    IndexBased,
}

/// One displayable aspect of a section's signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SectionAspect {
    pub number: i32,
    pub speed_limit: si::Velocity,
}

impl SectionAspect {
    pub fn new(number: i32, speed_limit: si::Velocity) -> Self {
        Self {
            number,
            speed_limit,
        }
    }
}

/// A signaling block. Sections form a chain through their previous/next
/// indices; occupancy and the station departure hold drive the aspect.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub previous_section: SectionIdx,
    #[serde(default)]
    pub next_section: SectionIdx,
    /// Trains whose interval overlaps this section.
    #[serde(default)]
    pub trains: Vec<TrainIdx>,
    /// Latched once the held train has reached the departure stop point.
    #[serde(default)]
    pub train_reached_stop_point: bool,
    /// Station whose departure signal this section carries.
    #[serde(default)]
    pub station_index: Option<usize>,
    pub track_position: si::Length,
    #[serde(default)]
    pub section_type: SectionType,
    pub aspects: Vec<SectionAspect>,
    #[serde(default)]
    pub current_aspect: usize,
    /// Count of free sections ahead. `None` means clear through the end.
    #[serde(default)]
    pub free_sections: Option<usize>,
}

impl Section {
    pub fn enter(&mut self, train: TrainIdx) {
        if !self.trains.contains(&train) {
            self.trains.push(train);
        }
    }

    pub fn leave(&mut self, train: TrainIdx) {
        self.trains.retain(|t| *t != train);
    }

    pub fn exists(&self, train: TrainIdx) -> bool {
        self.trains.contains(&train)
    }

    /// Whether no introduced train occupies this section.
    pub fn is_free(&self, trains: &[Train]) -> bool {
        self.is_free_disregarding(TRAIN_IDX_NA, trains)
    }

    /// Whether the section is free apart from `disregard` itself.
    pub fn is_free_disregarding(&self, disregard: TrainIdx, trains: &[Train]) -> bool {
        !self.trains.iter().any(|t| {
            *t != disregard
                && matches!(
                    trains[t.idx()].status,
                    crate::train::TrainStatus::Available | crate::train::TrainStatus::Bogus
                )
        })
    }

    fn first_available_train(&self, trains: &[Train]) -> Option<TrainIdx> {
        self.trains
            .iter()
            .find(|t| trains[t.idx()].status.is_available())
            .copied()
    }

    /// The current aspect's number, or zero for a section with no aspects.
    pub fn current_aspect_number(&self) -> i32 {
        match self.aspects.get(self.current_aspect) {
            Some(aspect) => aspect.number,
            None => 0,
        }
    }
}

impl ObjState for Section {
    fn is_fake(&self) -> bool {
        self.aspects.is_empty()
    }
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        early_fake_ok!(self);
        si_chk_num_fin(&mut errors, &self.track_position, "Track position");
        if self.current_aspect >= self.aspects.len() {
            errors.push(anyhow!("Current aspect must name an existing aspect!"));
        }
        for aspect in &self.aspects {
            si_chk_num_gez(&mut errors, &aspect.speed_limit, "Aspect speed limit");
        }
        errors.make_err()
    }
}

impl Valid for Section {
    fn valid() -> Self {
        Self {
            aspects: vec![
                SectionAspect::new(0, si::Velocity::ZERO),
                SectionAspect::new(2, 25.0 * uc::MPS),
                SectionAspect::new(4, f64::INFINITY * uc::MPS),
            ],
            ..Default::default()
        }
    }
}

/// Recomputes every section's aspect, starting from the last section of the
/// chain and walking backwards.
pub fn update_all_sections(
    sections: &mut [Section],
    trains: &[Train],
    stations: &[Station],
    player: TrainIdx,
    now: si::Time,
) {
    if sections.len() > 1 {
        update_section(sections, sections.len() - 1, trains, stations, player, now);
    }
}

/// Recomputes the aspect of one section and of every section behind it.
pub fn update_section(
    sections: &mut [Section],
    idx: usize,
    trains: &[Train],
    stations: &[Station],
    player: TrainIdx,
    now: si::Time,
) {
    let mut current = idx;
    loop {
        let aspect_count = sections[current].aspects.len();
        if aspect_count == 0 {
            break;
        }
        // the most restrictive aspect
        let zeroaspect = match sections[current].section_type {
            SectionType::ValueBased => {
                let mut zero = 0;
                for i in 1..aspect_count {
                    if sections[current].aspects[i].number < sections[current].aspects[zero].number
                    {
                        zero = i;
                    }
                }
                zero
            }
            SectionType::IndexBased => 0,
        };
        let mut settored = false;
        // hold the station departure signal at red
        if let Some(d) = sections[current].station_index {
            let station = &stations[d];
            // the train held here is the first one in the blocks behind,
            // falling back to the most delayed train anywhere
            let mut held = None;
            let mut l = sections[current].previous_section;
            while !l.is_fake() {
                if let Some(t) = sections[l.idx()].first_available_train(trains) {
                    held = Some(t);
                    break;
                }
                l = sections[l.idx()].previous_section;
            }
            if held.is_none() {
                let mut most_delayed = f64::MIN * uc::S;
                for (i, train) in trains.iter().enumerate().skip(1) {
                    if train.status.is_available() && train.timetable_delta > most_delayed {
                        most_delayed = train.timetable_delta;
                        held = Some(TrainIdx::new(i as u32));
                    }
                }
            }
            if let Some(t) = held {
                let train = &trains[t.idx()];
                if !sections[current].train_reached_stop_point && train.station == Some(d) {
                    match station.stops.get(station.stop_index(train.cars.len())) {
                        Some(stop) => {
                            if train.front_position()
                                >= stop.track_position - stop.backward_tolerance
                            {
                                sections[current].train_reached_stop_point = true;
                            }
                        }
                        None => sections[current].train_reached_stop_point = true,
                    }
                }
                let hold_until = match station.departure_time {
                    Some(departure) => Some(departure - 15.0 * uc::S),
                    None => station.arrival_time,
                };
                if t == player
                    && station.station_type != crate::signal::StationType::Normal
                    && station.departure_time.is_none()
                {
                    settored = true;
                } else if let Some(hold_until) = hold_until {
                    if hold_until >= si::Time::ZERO && now < hold_until - train.timetable_delta
                    {
                        settored = true;
                    }
                }
                if !sections[current].train_reached_stop_point {
                    settored = true;
                }
            } else if station.station_type != crate::signal::StationType::Normal {
                settored = true;
            }
        }
        // train in block
        if !sections[current].is_free(trains) {
            settored = true;
        }
        // free sections
        let mut newaspect = None;
        if settored {
            sections[current].free_sections = Some(0);
            newaspect = Some(zeroaspect);
        } else {
            let n = sections[current].next_section;
            sections[current].free_sections = if !n.is_fake() {
                sections[n.idx()].free_sections.map(|free| free + 1)
            } else {
                None
            };
        }
        // change aspect
        let newaspect = match newaspect {
            Some(aspect) => aspect,
            None => match sections[current].section_type {
                SectionType::ValueBased => {
                    let n = sections[current].next_section;
                    let mut a = sections[current].aspects[aspect_count - 1].number;
                    if !n.is_fake() {
                        a = sections[n.idx()].current_aspect_number();
                    }
                    let mut picked = None;
                    for i in (0..aspect_count).rev() {
                        if sections[current].aspects[i].number > a {
                            picked = Some(i);
                        }
                    }
                    picked.unwrap_or(aspect_count - 1)
                }
                SectionType::IndexBased => match sections[current].free_sections {
                    Some(free) if free < aspect_count => free,
                    _ => aspect_count - 1,
                },
            },
        };
        sections[current].current_aspect = newaspect;
        // walk backwards through the chain
        let previous = sections[current].previous_section;
        if previous.is_fake() {
            break;
        }
        current = previous.idx();
    }
}

/// How many signals ahead a safety plugin is told about.
pub const PLUGIN_SIGNAL_LOOKAHEAD: usize = 16;

/// The signal a safety plugin sees for one section: the aspect the train
/// will face there and the distance from the train's front to the section.
pub fn get_plugin_signal(
    sections: &[Section],
    trains: &[Train],
    train_idx: TrainIdx,
    section: usize,
) -> SignalData {
    let train = &trains[train_idx.idx()];
    let position = train.front_position();
    let distance = sections[section].track_position - position;
    let aspect_count = sections[section].aspects.len();
    let aspect = if sections[section].exists(train_idx) && aspect_count > 0 {
        if sections[section].is_free_disregarding(train_idx, trains) {
            match sections[section].section_type {
                SectionType::IndexBased => {
                    if section + 1 < sections.len() {
                        let value = match sections[section + 1].free_sections {
                            None => aspect_count - 1,
                            Some(free) => (free + 1).min(aspect_count - 1),
                        };
                        sections[section].aspects[value].number
                    } else {
                        sections[section].aspects[aspect_count - 1].number
                    }
                }
                SectionType::ValueBased => {
                    let mut aspect = sections[section].aspects[aspect_count - 1].number;
                    if section < sections.len() - 1 {
                        let value = sections[section + 1].current_aspect_number();
                        for i in 0..aspect_count {
                            if sections[section].aspects[i].number > value {
                                aspect = sections[section].aspects[i].number;
                                break;
                            }
                        }
                    }
                    aspect
                }
            }
        } else {
            sections[section].current_aspect_number()
        }
    } else {
        sections[section].current_aspect_number()
    };
    SignalData { aspect, distance }
}

/// Collects the signals ahead of a train for its safety plugin, stopping at
/// the first red or after the lookahead limit.
pub fn plugin_section_data(
    sections: &[Section],
    trains: &[Train],
    train_idx: TrainIdx,
) -> Vec<SignalData> {
    let train = &trains[train_idx.idx()];
    let start = if train.current_section.is_fake() {
        1
    } else {
        train.current_section.idx()
    };
    let mut data = Vec::new();
    for i in start..sections.len() {
        let signal = get_plugin_signal(sections, trains, train_idx, i);
        let aspect = signal.aspect;
        data.push(signal);
        if aspect == 0 || data.len() == PLUGIN_SIGNAL_LOOKAHEAD {
            break;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::train::TrainStatus;

    impl Cases for SectionIdx {
        fn real_cases() -> Vec<Self> {
            vec![Self::valid()]
        }
        fn fake_cases() -> Vec<Self> {
            vec![Self::new(0)]
        }
    }

    impl Cases for Section {
        fn fake_cases() -> Vec<Self> {
            vec![Self::default()]
        }
    }

    #[test]
    fn check_section_cases() {
        check_cases!(SectionIdx);
        check_cases!(Section);
    }

    /// Fake element at index 0 plus `n` chained sections 500 m apart.
    fn section_chain(n: u32) -> Vec<Section> {
        let mut sections = vec![Section::default()];
        for i in 1..=n {
            sections.push(Section {
                previous_section: SectionIdx::new(i - 1),
                next_section: if i < n {
                    SectionIdx::new(i + 1)
                } else {
                    SECTION_IDX_NA
                },
                track_position: (i as f64) * 500.0 * uc::M,
                ..Section::valid()
            });
        }
        sections
    }

    fn train_pool() -> Vec<Train> {
        vec![Train::default(), Train::valid(), Train::valid()]
    }

    #[test]
    fn test_occupancy_tracking() {
        let mut section = Section::valid();
        let a = TrainIdx::new(1);
        section.enter(a);
        section.enter(a);
        assert_eq!(section.trains.len(), 1);
        assert!(section.exists(a));
        let trains = train_pool();
        assert!(!section.is_free(&trains));
        assert!(section.is_free_disregarding(a, &trains));
        section.leave(a);
        assert!(!section.exists(a));
        assert!(section.is_free(&trains));
    }

    #[test]
    fn test_disposed_train_does_not_block() {
        let mut section = Section::valid();
        section.enter(TrainIdx::new(1));
        let mut trains = train_pool();
        trains[1].status = TrainStatus::Disposed;
        assert!(section.is_free(&trains));
        trains[1].status = TrainStatus::Bogus;
        assert!(!section.is_free(&trains));
    }

    #[test]
    fn test_value_based_cascade_behind_occupied_block() {
        let mut sections = section_chain(4);
        let trains = train_pool();
        sections[4].enter(TrainIdx::new(1));
        update_all_sections(&mut sections, &trains, &[], TRAIN_IDX_NA, si::Time::ZERO);
        // occupied block shows its most restrictive aspect
        assert_eq!(sections[4].current_aspect_number(), 0);
        assert_eq!(sections[4].free_sections, Some(0));
        // one block back shows the caution aspect
        assert_eq!(sections[3].current_aspect_number(), 2);
        assert_eq!(sections[3].free_sections, Some(1));
        // further back is clear
        assert_eq!(sections[2].current_aspect_number(), 4);
        assert_eq!(sections[1].current_aspect_number(), 4);
    }

    #[test]
    fn test_empty_route_is_clear_throughout() {
        let mut sections = section_chain(3);
        let trains = train_pool();
        update_all_sections(&mut sections, &trains, &[], TRAIN_IDX_NA, si::Time::ZERO);
        for section in &sections[1..] {
            assert_eq!(section.current_aspect_number(), 4);
            assert_eq!(section.free_sections, None);
        }
    }

    #[test]
    fn test_index_based_aspect_counts_free_sections() {
        let mut sections = section_chain(4);
        for section in &mut sections[1..] {
            section.section_type = SectionType::IndexBased;
        }
        let trains = train_pool();
        sections[3].enter(TrainIdx::new(1));
        update_all_sections(&mut sections, &trains, &[], TRAIN_IDX_NA, si::Time::ZERO);
        assert_eq!(sections[3].current_aspect, 0);
        assert_eq!(sections[2].current_aspect, 1);
        // two free blocks ahead, clamped to the aspect table
        assert_eq!(sections[1].current_aspect, 2);
    }

    fn held_station(departure: f64) -> Station {
        Station {
            departure_time: Some(departure * uc::S),
            stops: vec![crate::signal::StationStop {
                track_position: 700.0 * uc::M,
                ..Default::default()
            }],
            ..Station::valid()
        }
    }

    #[test]
    fn test_station_departure_hold() {
        let mut sections = section_chain(3);
        sections[2].station_index = Some(0);
        let stations = vec![held_station(300.0)];
        let mut trains = train_pool();
        trains[1].station = Some(0);
        // train short of the stop point keeps the signal at red
        sections[1].enter(TrainIdx::new(1));
        let player = TrainIdx::new(1);
        update_all_sections(&mut sections, &trains, &stations, player, si::Time::ZERO);
        assert_eq!(sections[2].current_aspect_number(), 0);
        assert!(!sections[2].train_reached_stop_point);
        // move the train up to the stop point; still held for time
        let offset = 698.0 * uc::M - trains[1].front_position();
        for car in &mut trains[1].cars {
            car.front_axle.follower.track_position += offset;
            car.rear_axle.follower.track_position += offset;
        }
        update_all_sections(&mut sections, &trains, &stations, player, 100.0 * uc::S);
        assert!(sections[2].train_reached_stop_point);
        assert_eq!(sections[2].current_aspect_number(), 0);
        // released fifteen seconds before departure
        update_all_sections(&mut sections, &trains, &stations, player, 290.0 * uc::S);
        assert!(sections[2].current_aspect_number() > 0);
    }

    #[test]
    fn test_plugin_signal_lookahead_stops_at_red() {
        let mut sections = section_chain(6);
        let mut trains = train_pool();
        trains[1].current_section = SectionIdx::new(1);
        sections[1].enter(TrainIdx::new(1));
        sections[4].enter(TrainIdx::new(2));
        update_all_sections(&mut sections, &trains, &[], TRAIN_IDX_NA, si::Time::ZERO);
        let data = plugin_section_data(&sections, &trains, TrainIdx::new(1));
        // own section, then clear, caution, and the red block
        assert_eq!(data.len(), 4);
        assert_eq!(data[0].aspect, 4);
        assert_eq!(data[2].aspect, 2);
        assert_eq!(data[3].aspect, 0);
        // distances are measured from the train's front
        assert!(data[1].distance > data[0].distance);
    }

    #[test]
    fn test_update_section_is_idempotent() {
        let mut sections = section_chain(4);
        let trains = train_pool();
        sections[4].enter(TrainIdx::new(1));
        update_all_sections(&mut sections, &trains, &[], TRAIN_IDX_NA, si::Time::ZERO);
        let snapshot = sections.clone();
        update_all_sections(&mut sections, &trains, &[], TRAIN_IDX_NA, si::Time::ZERO);
        assert_eq!(sections, snapshot);
    }
}
