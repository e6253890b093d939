//! Driver controls and the delayed-application model. Each handle has a
//! driver position, a safety position (which an installed safety plugin may
//! override), and the actual position the equipment has reached. Notch
//! changes step through a queue so the equipment trails the handle by the
//! configured delays.

use crate::imports::*;

/// Position of the automatic air brake driver valve.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AirBrakeHandleState {
    #[default]
    Release,
    Lap,
    Service,
}

/// A queued notch change that takes effect at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandleChange {
    pub value: u8,
    pub time: si::Time,
}

/// A notched handle with delayed actual-position tracking.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotchHandle {
    pub driver: u8,
    pub safety: u8,
    pub actual: u8,
    #[serde(default)]
    pub delayed_changes: VecDeque<HandleChange>,
}

impl NotchHandle {
    fn add_change(&mut self, value: u8, now: si::Time, delay: si::Time) {
        self.delayed_changes.push_back(HandleChange {
            value,
            time: now + delay,
        });
    }
    fn apply_due_change(&mut self, now: si::Time) {
        if let Some(front) = self.delayed_changes.front() {
            if front.time <= now {
                self.actual = front.value;
                self.delayed_changes.pop_front();
            }
        }
    }
}

/// The automatic air brake handle, applied after a short delay except for
/// Lap which takes effect immediately.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AirBrakeHandle {
    pub driver: AirBrakeHandleState,
    pub safety: AirBrakeHandleState,
    pub actual: AirBrakeHandleState,
    #[serde(default)]
    delayed: Option<(AirBrakeHandleState, si::Time)>,
}

impl AirBrakeHandle {
    fn update(&mut self, now: si::Time) {
        if let Some((value, time)) = self.delayed {
            if time <= now {
                self.actual = value;
                self.delayed = None;
            }
        } else if self.safety == AirBrakeHandleState::Release
            && self.actual != AirBrakeHandleState::Release
        {
            self.delayed = Some((AirBrakeHandleState::Release, now));
        } else if self.safety == AirBrakeHandleState::Service
            && self.actual != AirBrakeHandleState::Service
        {
            self.delayed = Some((AirBrakeHandleState::Service, now));
        } else if self.safety == AirBrakeHandleState::Lap {
            self.actual = AirBrakeHandleState::Lap;
        }
    }
}

/// The emergency brake with its application-time latch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmergencyHandle {
    pub driver: bool,
    pub safety: bool,
    pub actual: bool,
    #[serde(default = "never")]
    pub application_time: si::Time,
}

fn never() -> si::Time {
    f64::MAX * uc::S
}

impl Default for EmergencyHandle {
    fn default() -> Self {
        Self {
            driver: false,
            safety: false,
            actual: false,
            application_time: never(),
        }
    }
}

impl EmergencyHandle {
    fn update(&mut self, now: si::Time) {
        if self.safety && !self.actual {
            if now < self.application_time {
                self.application_time = now;
            }
            if self.application_time <= now {
                self.actual = true;
                self.application_time = never();
            }
        } else if !self.safety {
            self.actual = false;
        }
    }
}

/// All of one train's driver controls.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainHandles {
    pub reverser_driver: i8,
    pub reverser_actual: i8,
    /// Power and brake share one physical handle.
    pub single_handle: bool,
    pub power_notch: NotchHandle,
    pub brake_notch: NotchHandle,
    pub maximum_power_notch: u8,
    pub maximum_brake_notch: u8,
    /// Notches a safety-commanded power reduction may skip in one change.
    pub power_notch_reduce_steps: u8,
    pub air_brake: AirBrakeHandle,
    pub emergency: EmergencyHandle,
    pub has_hold_brake: bool,
    pub hold_brake_driver: bool,
    pub hold_brake_actual: bool,
    pub has_const_speed: bool,
    pub const_speed: bool,
    pub delay_power_up: si::Time,
    pub delay_power_down: si::Time,
    pub delay_brake_up: si::Time,
    pub delay_brake_down: si::Time,
}

impl TrainHandles {
    pub fn apply_reverser(&mut self, value: i8) {
        let value = value.clamp(-1, 1);
        self.reverser_driver = value;
        self.reverser_actual = value;
    }

    pub fn apply_power(&mut self, notch: u8) {
        self.power_notch.driver = notch.min(self.maximum_power_notch);
    }

    pub fn apply_brake(&mut self, notch: u8) {
        self.brake_notch.driver = notch.min(self.maximum_brake_notch);
    }

    pub fn apply_air_brake_handle(&mut self, state: AirBrakeHandleState) {
        self.air_brake.driver = state;
    }

    pub fn apply_emergency(&mut self, applied: bool) {
        self.emergency.driver = applied;
        if applied {
            self.power_notch.driver = 0;
            self.brake_notch.driver = self.maximum_brake_notch;
            self.air_brake.driver = AirBrakeHandleState::Service;
        }
    }

    pub fn apply_hold_brake(&mut self, applied: bool) {
        self.hold_brake_driver = applied && self.has_hold_brake;
    }

    pub fn apply_const_speed(&mut self, engaged: bool) {
        self.const_speed = engaged && self.has_const_speed;
    }

    /// Copies driver positions into the safety layer. Trains without a
    /// safety plugin call this every tick; plugins overwrite afterwards.
    pub fn copy_driver_to_safety(&mut self) {
        self.power_notch.safety = self.power_notch.driver;
        self.brake_notch.safety = self.brake_notch.driver;
        self.air_brake.safety = self.air_brake.driver;
        self.emergency.safety = self.emergency.driver;
    }

    /// Steps the actual handle positions toward the safety positions
    /// through the delayed-change queues.
    pub fn update_delayed(&mut self, now: si::Time) {
        // power notch
        if self.power_notch.delayed_changes.is_empty() {
            if self.power_notch.safety < self.power_notch.actual {
                if self.power_notch_reduce_steps <= 1 {
                    self.power_notch.add_change(
                        self.power_notch.actual - 1,
                        now,
                        self.delay_power_down,
                    );
                } else if self.power_notch.safety + self.power_notch_reduce_steps
                    <= self.power_notch.actual
                    || self.power_notch.safety == 0
                {
                    self.power_notch
                        .add_change(self.power_notch.safety, now, self.delay_power_down);
                }
            } else if self.power_notch.safety > self.power_notch.actual {
                self.power_notch
                    .add_change(self.power_notch.actual + 1, now, self.delay_power_up);
            }
        } else {
            let last = self.power_notch.delayed_changes.back().unwrap().value;
            if self.power_notch.safety < last {
                self.power_notch
                    .add_change(self.power_notch.safety, now, self.delay_power_down);
            } else if self.power_notch.safety > last {
                self.power_notch
                    .add_change(self.power_notch.safety, now, self.delay_power_up);
            }
        }
        self.power_notch.apply_due_change(now);
        // brake notch; a safety emergency commands the full service notch
        let commanded = if self.emergency.safety {
            self.maximum_brake_notch
        } else {
            self.brake_notch.safety
        };
        if self.brake_notch.delayed_changes.is_empty() {
            if commanded < self.brake_notch.actual {
                self.brake_notch
                    .add_change(self.brake_notch.actual - 1, now, self.delay_brake_down);
            } else if commanded > self.brake_notch.actual {
                self.brake_notch
                    .add_change(self.brake_notch.actual + 1, now, self.delay_brake_up);
            }
        } else {
            let last = self.brake_notch.delayed_changes.back().unwrap().value;
            if commanded < last {
                self.brake_notch
                    .add_change(commanded, now, self.delay_brake_down);
            } else if commanded > last {
                self.brake_notch
                    .add_change(commanded, now, self.delay_brake_up);
            }
        }
        self.brake_notch.apply_due_change(now);
        // air brake handle
        self.air_brake.update(now);
        // emergency brake
        self.emergency.update(now);
        self.hold_brake_actual = self.hold_brake_driver;
    }
}

impl ObjState for TrainHandles {
    fn validate(&self) -> ValidationResults {
        let mut errors = ValidationErrors::new();
        if self.reverser_driver.abs() > 1 || self.reverser_actual.abs() > 1 {
            errors.push(anyhow!("Reverser position must be -1, 0, or 1!"));
        }
        if self.power_notch.driver > self.maximum_power_notch {
            errors.push(anyhow!("Power notch must not exceed its maximum!"));
        }
        if self.brake_notch.driver > self.maximum_brake_notch {
            errors.push(anyhow!("Brake notch must not exceed its maximum!"));
        }
        si_chk_num_gez(&mut errors, &self.delay_power_up, "Power application delay");
        si_chk_num_gez(&mut errors, &self.delay_power_down, "Power release delay");
        si_chk_num_gez(&mut errors, &self.delay_brake_up, "Brake application delay");
        si_chk_num_gez(&mut errors, &self.delay_brake_down, "Brake release delay");
        errors.make_err()
    }
}

impl Valid for TrainHandles {
    fn valid() -> Self {
        Self {
            maximum_power_notch: 5,
            maximum_brake_notch: 8,
            power_notch_reduce_steps: 1,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    impl Cases for TrainHandles {}

    #[test]
    fn check_handles_cases() {
        check_cases!(TrainHandles);
    }

    fn step(handles: &mut TrainHandles, now: si::Time) {
        handles.copy_driver_to_safety();
        handles.update_delayed(now);
    }

    #[test]
    fn test_power_notch_steps_through_delay() {
        let mut handles = TrainHandles {
            delay_power_up: 0.5 * uc::S,
            ..TrainHandles::valid()
        };
        handles.apply_power(3);
        let mut now = si::Time::ZERO;
        step(&mut handles, now);
        // change queued but not yet due
        assert_eq!(handles.power_notch.actual, 0);
        now += 0.6 * uc::S;
        step(&mut handles, now);
        assert_eq!(handles.power_notch.actual, 1);
        now += 0.6 * uc::S;
        step(&mut handles, now);
        now += 0.6 * uc::S;
        step(&mut handles, now);
        assert_eq!(handles.power_notch.actual, 3);
    }

    #[test]
    fn test_zero_delay_applies_one_notch_per_tick() {
        let mut handles = TrainHandles::valid();
        handles.apply_brake(4);
        let mut now = si::Time::ZERO;
        for expected in 1..=4 {
            step(&mut handles, now);
            assert_eq!(handles.brake_notch.actual, expected);
            now += 0.1 * uc::S;
        }
    }

    #[test]
    fn test_emergency_commands_full_brake() {
        let mut handles = TrainHandles::valid();
        handles.apply_emergency(true);
        let mut now = si::Time::ZERO;
        for _ in 0..10 {
            step(&mut handles, now);
            now += 0.1 * uc::S;
        }
        assert!(handles.emergency.actual);
        assert_eq!(handles.brake_notch.actual, handles.maximum_brake_notch);
        handles.apply_emergency(false);
        step(&mut handles, now);
        assert!(!handles.emergency.actual);
    }

    #[test]
    fn test_air_brake_lap_is_immediate() {
        let mut handles = TrainHandles::valid();
        handles.apply_air_brake_handle(AirBrakeHandleState::Lap);
        step(&mut handles, si::Time::ZERO);
        assert_eq!(handles.air_brake.actual, AirBrakeHandleState::Lap);
    }
}
