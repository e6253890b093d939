use crate::imports::*;
use crate::track::{TrackProfile, TrackSample};

/// A point riding along a track profile, caching its interval index so that
/// repeated lookups stay O(1) while the point moves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxleFollower {
    pub track_position: si::Length,
    idx: usize,
    pub sample: TrackSample,
}

impl AxleFollower {
    pub fn new(profile: &TrackProfile, track_position: si::Length) -> anyhow::Result<Self> {
        let mut follower = Self {
            track_position,
            idx: 0,
            sample: Default::default(),
        };
        follower.sample = profile.sample(track_position, &mut follower.idx, &Dir::Unk)?;
        Ok(follower)
    }

    /// Moves the follower to `track_position` and refreshes its cached
    /// sample.
    pub fn advance(
        &mut self,
        profile: &TrackProfile,
        track_position: si::Length,
    ) -> anyhow::Result<()> {
        let dir = if track_position >= self.track_position {
            Dir::Fwd
        } else {
            Dir::Bwd
        };
        self.track_position = track_position;
        self.sample = profile.sample(track_position, &mut self.idx, &dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackPoint;

    fn graded_profile() -> TrackProfile {
        TrackProfile {
            points: vec![
                TrackPoint::default(),
                TrackPoint {
                    offset: 1.0 * uc::KM,
                    direction_y: 0.01,
                    ..TrackPoint::default()
                },
                TrackPoint {
                    offset: 2.0 * uc::KM,
                    direction_y: 0.01,
                    ..TrackPoint::default()
                },
            ],
            beacons: Vec::new(),
        }
    }

    #[test]
    fn test_advance_both_directions() {
        let profile = graded_profile();
        let mut follower = AxleFollower::new(&profile, 0.0 * uc::M).unwrap();
        follower.advance(&profile, 1.5 * uc::KM).unwrap();
        assert!(almost_eq(follower.sample.direction_y, 0.01, None));
        follower.advance(&profile, 500.0 * uc::M).unwrap();
        assert!(almost_eq(follower.sample.direction_y, 0.005, None));
    }
}
