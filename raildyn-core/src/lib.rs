//! Simulation core for multi-car train dynamics and block signaling.
//!
//! The crate models the continuous side (speed integration, air-brake
//! pneumatics, traction and adhesion, coupler spacing and collisions) and the
//! discrete side (section occupancy, signal aspect propagation, station
//! holds) of a running railway, together with the narrow interfaces between
//! them and the outside world (track geometry, safety plugins, score sinks).

pub mod error;
pub mod imports;
pub mod lin_search_hint;
pub mod plugin;
pub mod prelude;
pub mod score;
pub mod si;
pub mod signal;
pub mod sim;
pub mod track;
pub mod train;
pub mod traits;
pub mod uc;
pub mod utils;
pub mod validate;

#[cfg(test)]
pub mod testing;
