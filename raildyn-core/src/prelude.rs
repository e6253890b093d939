//! Convenience re-exports of the crate's main public types.

pub use crate::error::Error;
pub use crate::plugin::{
    BeaconData, DoorState, ElapseData, HandleCommand, HandleSnapshot, NoOpPlugin, PluginHost,
    SafetyPlugin, SignalData,
};
pub use crate::score::{ScoreEvent, ScoreReason, ScoreTracker};
pub use crate::signal::{
    get_plugin_signal, plugin_section_data, update_all_sections, update_section, Section,
    SectionAspect, SectionIdx, SectionType, Station, StationStop, StationStopMode, StationType,
    PLUGIN_SIGNAL_LOOKAHEAD, SECTION_IDX_NA,
};
pub use crate::sim::{SimOptions, Simulation};
pub use crate::track::{AxleFollower, TrackBeacon, TrackPoint, TrackProfile, TrackSample};
pub use crate::train::{
    AccelerationCurve, AirBrakeHandleState, AirBrakeSource, Axle, BrakeType, Car, CarAirBrake,
    Coupler, ElectropneumaticBrakeType, ReAdhesionDevice, Train, TrainDoors, TrainHandles,
    TrainIdx, TrainPassengers, TrainStatus, TrainStopState, TRAIN_IDX_NA,
};
pub use crate::traits::SerdeAPI;
pub use crate::validate::{ObjState, Valid, ValidationErrors, ValidationResults};
