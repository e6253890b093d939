//! Block signaling: sections chained along the track, their aspect logic,
//! and the stations whose departure signals they carry.

mod section;
mod station;

pub use section::*;
pub use station::*;
