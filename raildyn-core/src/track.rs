//! Track geometry sampled along a route.

mod follower;
mod profile;

pub use follower::*;
pub use profile::*;
