//! Safety-system plugins. A plugin rides along with one train, sees the
//! vehicle state and the signals ahead each tick, and may override the
//! driver's handles through the safety layer.

use crate::imports::*;
use crate::train::TrainHandles;

/// One upcoming signal as reported to a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    pub aspect: i32,
    /// Distance from the front of the train to the section boundary.
    pub distance: si::Length,
}

/// A beacon the front axle passed during the last tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeaconData {
    pub kind: i32,
    pub data: i32,
    /// The signal of the section the beacon is attached to.
    pub signal: SignalData,
}

/// Aggregate door state of the train.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorState {
    pub left: bool,
    pub right: bool,
}

/// The driver handle positions as a plugin sees them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub reverser: i8,
    pub power_notch: u8,
    pub brake_notch: u8,
    pub const_speed: bool,
}

/// Everything a plugin is told on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElapseData {
    /// Track position of the front of the train.
    pub location: si::Length,
    pub speed: si::Velocity,
    pub brake_pipe_pressure: si::Pressure,
    pub brake_cylinder_pressure: si::Pressure,
    pub main_reservoir_pressure: si::Pressure,
    pub handles: HandleSnapshot,
    pub doors: DoorState,
    pub total_time: si::Time,
    pub elapsed_time: si::Time,
}

/// What a plugin commands after a tick. `None` fields leave the driver's
/// position in force.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandleCommand {
    pub reverser: Option<i8>,
    pub power_notch: Option<u8>,
    /// A brake notch beyond the train's maximum commands the emergency
    /// brake.
    pub brake_notch: Option<u8>,
    pub emergency: Option<bool>,
    pub const_speed: Option<bool>,
}

/// A train-borne safety system. All notifications default to no-ops so
/// implementations only write the hooks they need.
pub trait SafetyPlugin: Send {
    /// Called once per tick with the vehicle state. The returned command is
    /// applied to the safety layer of the train's handles.
    fn elapse(&mut self, data: &ElapseData) -> anyhow::Result<HandleCommand>;

    fn set_reverser(&mut self, _reverser: i8) {}
    fn set_power(&mut self, _notch: u8) {}
    fn set_brake(&mut self, _notch: u8) {}
    /// The signals ahead of the train, nearest first.
    fn set_signals(&mut self, _signals: &[SignalData]) {}
    fn set_beacon(&mut self, _beacon: &BeaconData) {}
    fn door_change(&mut self, _old: DoorState, _new: DoorState) {}
    fn key_down(&mut self, _key: i32) {}
    fn key_up(&mut self, _key: i32) {}
    fn horn_blow(&mut self, _horn: i32) {}
}

/// Plugin that never intervenes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPlugin;

impl SafetyPlugin for NoOpPlugin {
    fn elapse(&mut self, _data: &ElapseData) -> anyhow::Result<HandleCommand> {
        Ok(HandleCommand::default())
    }
}

/// Owns a plugin and fences off its failures: a plugin that returns an
/// error is disabled for the rest of the run.
pub struct PluginHost {
    plugin: Box<dyn SafetyPlugin>,
    failed: bool,
    pub last_error: Option<String>,
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("failed", &self.failed)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    pub fn new(plugin: Box<dyn SafetyPlugin>) -> Self {
        Self {
            plugin,
            failed: false,
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.failed
    }

    /// Runs the plugin's tick and applies its command to the safety layer.
    pub fn elapse(&mut self, data: &ElapseData, handles: &mut TrainHandles) {
        if self.failed {
            return;
        }
        match self.plugin.elapse(data) {
            Ok(command) => Self::apply(&command, handles),
            Err(error) => {
                log::warn!("disabling safety plugin after error: {error}");
                self.last_error = Some(format!("{error}"));
                self.failed = true;
            }
        }
    }

    fn apply(command: &HandleCommand, handles: &mut TrainHandles) {
        if let Some(reverser) = command.reverser {
            handles.reverser_actual = reverser.clamp(-1, 1);
        }
        if let Some(notch) = command.power_notch {
            handles.power_notch.safety = notch.min(handles.maximum_power_notch);
        }
        if let Some(notch) = command.brake_notch {
            if notch > handles.maximum_brake_notch {
                handles.emergency.safety = true;
                handles.brake_notch.safety = handles.maximum_brake_notch;
            } else {
                handles.brake_notch.safety = notch;
            }
        }
        if let Some(emergency) = command.emergency {
            handles.emergency.safety = emergency;
        }
        if let Some(const_speed) = command.const_speed {
            handles.const_speed = const_speed && handles.has_const_speed;
        }
    }

    pub fn set_reverser(&mut self, reverser: i8) {
        if !self.failed {
            self.plugin.set_reverser(reverser);
        }
    }

    pub fn set_power(&mut self, notch: u8) {
        if !self.failed {
            self.plugin.set_power(notch);
        }
    }

    pub fn set_brake(&mut self, notch: u8) {
        if !self.failed {
            self.plugin.set_brake(notch);
        }
    }

    pub fn set_signals(&mut self, signals: &[SignalData]) {
        if !self.failed {
            self.plugin.set_signals(signals);
        }
    }

    pub fn set_beacon(&mut self, beacon: &BeaconData) {
        if !self.failed {
            self.plugin.set_beacon(beacon);
        }
    }

    pub fn door_change(&mut self, old: DoorState, new: DoorState) {
        if !self.failed {
            self.plugin.door_change(old, new);
        }
    }

    pub fn key_down(&mut self, key: i32) {
        if !self.failed {
            self.plugin.key_down(key);
        }
    }

    pub fn key_up(&mut self, key: i32) {
        if !self.failed {
            self.plugin.key_up(key);
        }
    }

    pub fn horn_blow(&mut self, horn: i32) {
        if !self.failed {
            self.plugin.horn_blow(horn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elapse_data() -> ElapseData {
        ElapseData {
            location: si::Length::ZERO,
            speed: si::Velocity::ZERO,
            brake_pipe_pressure: si::Pressure::ZERO,
            brake_cylinder_pressure: si::Pressure::ZERO,
            main_reservoir_pressure: si::Pressure::ZERO,
            handles: HandleSnapshot::default(),
            doors: DoorState::default(),
            total_time: si::Time::ZERO,
            elapsed_time: 0.1 * uc::S,
        }
    }

    struct EmergencyPlugin;
    impl SafetyPlugin for EmergencyPlugin {
        fn elapse(&mut self, _data: &ElapseData) -> anyhow::Result<HandleCommand> {
            Ok(HandleCommand {
                brake_notch: Some(u8::MAX),
                ..Default::default()
            })
        }
    }

    struct FailingPlugin;
    impl SafetyPlugin for FailingPlugin {
        fn elapse(&mut self, _data: &ElapseData) -> anyhow::Result<HandleCommand> {
            bail!("plugin blew up")
        }
    }

    #[test]
    fn test_overlarge_brake_notch_commands_emergency() {
        let mut host = PluginHost::new(Box::new(EmergencyPlugin));
        let mut handles = TrainHandles::valid();
        host.elapse(&elapse_data(), &mut handles);
        assert!(handles.emergency.safety);
        assert_eq!(handles.brake_notch.safety, handles.maximum_brake_notch);
    }

    #[test]
    fn test_failing_plugin_is_disabled() {
        let mut host = PluginHost::new(Box::new(FailingPlugin));
        let mut handles = TrainHandles::valid();
        handles.apply_power(2);
        handles.copy_driver_to_safety();
        host.elapse(&elapse_data(), &mut handles);
        assert!(!host.is_active());
        assert!(host.last_error.is_some());
        // the driver's positions stay in force
        assert_eq!(handles.power_notch.safety, 2);
        host.elapse(&elapse_data(), &mut handles);
        assert!(!host.is_active());
    }

    #[test]
    fn test_noop_plugin_leaves_handles_alone() {
        let mut host = PluginHost::new(Box::new(NoOpPlugin));
        let mut handles = TrainHandles::valid();
        handles.apply_power(3);
        handles.copy_driver_to_safety();
        host.elapse(&elapse_data(), &mut handles);
        assert_eq!(handles.power_notch.safety, 3);
        assert!(!handles.emergency.safety);
    }
}
