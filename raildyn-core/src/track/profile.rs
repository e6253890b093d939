use crate::imports::*;
use crate::signal::SectionIdx;

/// Geometry and surface data at one sampled track offset. Offsets must be
/// strictly increasing along the profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Distance from route origin.
    pub offset: si::Length,
    /// Vertical component of the unit tangent vector. Positive is uphill.
    pub direction_y: f64,
    /// Vertical component of the unit up vector. 1.0 on level tangent track.
    pub up_y: f64,
    /// Horizontal curve radius. Zero means tangent track.
    pub curve_radius: si::Length,
    /// Superelevation of the outer rail.
    pub cant: si::Length,
    /// Local adhesion multiplier applied to the static friction coefficient.
    pub adhesion: f64,
}

impl Default for TrackPoint {
    fn default() -> Self {
        Self {
            offset: si::Length::ZERO,
            direction_y: 0.0,
            up_y: 1.0,
            curve_radius: si::Length::ZERO,
            cant: si::Length::ZERO,
            adhesion: 1.0,
        }
    }
}

impl GetOffset for TrackPoint {
    fn get_offset(&self) -> si::Length {
        self.offset
    }
}

impl ObjState for TrackPoint {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        si_chk_num_fin(&mut errors, &self.offset, "Offset");
        chk_num_fin(&mut errors, self.direction_y, "Direction y");
        chk_num_fin(&mut errors, self.up_y, "Up y");
        si_chk_num_gez(&mut errors, &self.curve_radius, "Curve radius");
        si_chk_num_fin(&mut errors, &self.cant, "Cant");
        chk_num_gtz(&mut errors, self.adhesion, "Adhesion multiplier");
        errors.make_err()
    }
}

/// Interpolated track state at an arbitrary offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackSample {
    pub direction_y: f64,
    pub up_y: f64,
    pub curve_radius: si::Length,
    pub cant: si::Length,
    pub adhesion: f64,
}

impl Default for TrackSample {
    fn default() -> Self {
        Self {
            direction_y: 0.0,
            up_y: 1.0,
            curve_radius: si::Length::ZERO,
            cant: si::Length::ZERO,
            adhesion: 1.0,
        }
    }
}

/// Trackside transponder passed to a train's safety plugin when the front
/// axle crosses its offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackBeacon {
    pub offset: si::Length,
    /// Beacon type number, forwarded to the plugin verbatim.
    pub kind: i32,
    /// Optional beacon payload, forwarded to the plugin verbatim.
    pub data: i32,
    /// Section whose aspect the beacon reports, or NA for none.
    pub section: SectionIdx,
}

impl GetOffset for TrackBeacon {
    fn get_offset(&self) -> si::Length {
        self.offset
    }
}

/// A route's sampled geometry table plus its trackside beacons.
///
/// Sampling interpolates the tangent and up vectors linearly between points
/// and holds curve radius, cant, and adhesion constant over each interval.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackProfile {
    pub points: Vec<TrackPoint>,
    /// Sorted by offset.
    #[serde(default)]
    pub beacons: Vec<TrackBeacon>,
}

impl TrackProfile {
    pub fn len(&self) -> si::Length {
        match self.points.last() {
            Some(point) => point.offset,
            None => si::Length::ZERO,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Samples the profile at `offset`, clamped to the table bounds.
    /// `idx` is the caller's previous interval index and is updated in place.
    pub fn sample(
        &self,
        offset: si::Length,
        idx: &mut usize,
        dir: &Dir,
    ) -> anyhow::Result<TrackSample> {
        let points = self.points.as_slice();
        ensure!(
            points.len() >= 2,
            "{}\nTrack profile needs at least 2 points!",
            format_dbg!()
        );
        let offset = offset
            .max(points.first().unwrap().offset)
            .min(points.last().unwrap().offset);
        *idx = (*idx).min(points.len() - 2);
        *idx = points.calc_idx(offset, *idx, dir)?;
        let lower = &points[*idx];
        let upper = &points[(*idx + 1).min(points.len() - 1)];
        let span = upper.offset - lower.offset;
        let frac = if span > si::Length::ZERO {
            ((offset - lower.offset) / span).get::<si::ratio>()
        } else {
            0.0
        };
        Ok(TrackSample {
            direction_y: lower.direction_y + frac * (upper.direction_y - lower.direction_y),
            up_y: lower.up_y + frac * (upper.up_y - lower.up_y),
            curve_radius: lower.curve_radius,
            cant: lower.cant,
            adhesion: lower.adhesion,
        })
    }

    /// Beacons with offsets in the half-open interval swept by a movement
    /// from `prev` to `curr`. Only forward sweeps report beacons.
    pub fn beacons_crossed(&self, prev: si::Length, curr: si::Length) -> Vec<TrackBeacon> {
        if curr <= prev {
            return Vec::new();
        }
        self.beacons
            .iter()
            .filter(|beacon| prev < beacon.offset && beacon.offset <= curr)
            .copied()
            .collect()
    }
}

impl SerdeAPI for TrackProfile {
    fn init(&mut self) -> anyhow::Result<()> {
        self.validate().map_err(|err| anyhow!("{err}"))
    }
}

impl ObjState for TrackProfile {
    fn is_fake(&self) -> bool {
        self.points.is_empty()
    }
    fn validate(&self) -> ValidationResults {
        early_fake_ok!(self);
        let mut errors = ValidationErrors::new();
        validate_slice_real(&mut errors, &self.points, "Track point");
        if self.points.len() < 2 {
            errors.push(anyhow!("Track profile must have at least 2 points!"));
        }
        for pair in self.points.windows(2) {
            if pair[0].offset >= pair[1].offset {
                errors.push(anyhow!(
                    "Track point offsets must be strictly increasing at {} m!",
                    pair[1].offset.get::<si::meter>()
                ));
            }
        }
        for pair in self.beacons.windows(2) {
            if pair[0].offset > pair[1].offset {
                errors.push(anyhow!(
                    "Beacon offsets must be sorted at {} m!",
                    pair[1].offset.get::<si::meter>()
                ));
            }
        }
        errors.make_err()
    }
}

impl Valid for TrackProfile {
    fn valid() -> Self {
        Self {
            points: vec![
                TrackPoint::default(),
                TrackPoint {
                    offset: 10.0 * uc::KM,
                    ..TrackPoint::default()
                },
            ],
            beacons: Vec::new(),
        }
    }
}
