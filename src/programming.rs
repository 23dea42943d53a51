//! Programming actuators to obey the host.
//!
//! Actuators act on the radio senders listed in their function-group memory.
//! Each row names a sender, the key and key function it uses, and the channels
//! it acts on. To control an actuator channel from the host, a row for a sender
//! the host can send as is written once with
//! [`MemorySession::ensure_programmed`]; from then on telegrams of that sender
//! switch or dim the channel, see [`Master::set_state`](crate::Master::set_state).
//!
//! ## Example
//! ```no_run
//! # fn f(master: &eltako_bus::Master, device: &eltako_bus::Device) -> Result<(), eltako_bus::Error> {
//! use eltako_bus::Command;
//!
//! let session = master.unlock_memory(device)?;
//! let command = session.ensure_direct_command(0)?;
//! session.lock()?;
//! master.set_state(&command, &Command::Switch { on: true })?;
//! # Ok(()) }
//! ```

use std::ops::Range;

use log::{debug, info};
use snafu::{ensure, OptionExt};

use crate::device::{Device, DeviceType};
use crate::eep::{self, eep, Command, EncodeError, Eep, RockerButton, Rorg};
use crate::master::{
    Error, MemoryFullSnafu, NoSuchChannelSnafu, NotProgrammableSnafu, UnsupportedSourceSnafu,
};
use crate::memory::MemorySession;
use crate::telegram::{RadioTelegram, RowData, Telegram};
use crate::types::RadioId;

/// Rocker switch, the profile of direct switching commands.
pub const ROCKER: Eep = eep(Rorg::Rps, 0x02, 0x01);
const ROCKER_UP: Eep = eep(Rorg::Rps, 0x02, 0x02);
/// Central command, the profile of direct dimming commands.
pub const CENTRAL_COMMAND: Eep = eep(Rorg::FourBs, 0x38, 0x08);
const SHUTTER_COMMAND: Eep = eep(Rorg::ShutterCommand, 0x3f, 0x7f);
const ROOM_PANEL: Eep = eep(Rorg::FourBs, 0x10, 0x06);

/// Key function of a function-group row, numbered as in the vendor's configuration tool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeyFunction {
    NoFunction,
    UniversalPushButton,
    DirectionPushButtonTopOn,
    DirectionPushButtonBottomOn,
    CentralOff,
    CentralOn,
    ScenePushbutton,
    SequentialScenePushButton,
    LightAlarm,
    DimmingValueInPercentage,
    StaircasePushButton,
    CentralUpDown,
    CentralUpDownWithDynamicPriority,
    WindowContact,
    NoWindowContact,
    NcWindowContact,
    CentralUpDownWithStaticPriority,
    CentralOffWithStaticPriority,
    CentralOnWithStaticPriority,
    UniversalPushButtonEs,
    UniversalPushButtonEr,
    WindowHandleFtke,
    NoWindowHandle,
    NcWindowHandle,
    FourFoldTestPushButton,
    FourFoldPushButton,
    OperationsCommandWithTimeValueTransmissionFromController,
    DimmingValueFromController,
    FbhWithBrightnessEvaluation,
    FbhWithoutBrightnessEvaluation,
    MotionDetectorAccordingToEepA50701,
    Fah60WithDaylightEvaluation,
    Fah60TwilightPushButton,
    Fah60TwilightDimmer,
    Fah60ForControlOfRollerShutter,
    Fwg14msWeatherStation,
    Fih65bForConstantLightControl,
    TargetBrightnessMemoryButton,
    WaterSensorAccordingToEepA53030,
    WaterSensorRpsTelegram,
    SmokeDetector,
    SwitchingStateFromController,
    ActivationSnoozeFunction,
    FbhWithBrightnessEvaluationOnlyAtSwitchOnForWarmLight,
    LinkedActuatorFeedback,
    TemperatureControllerWithSetpoint,
    TemperatureControllerWithoutSlideSwitch,
    TemperatureControllerWithSlideSwitchSunMoon,
    TemperatureControllerAccordingEepA51006Ftr55d,
    TemperatureControllerSetpoint,
    TemperatureControllerAccordingEepA50205,
    HumidityTemperatureSensorAccordingToEepA50402,
    TemperatureSensorAccordingToEepA51002,
    HumidityTemperatureSensorFuthAccordingToEepA51012,
    TemperatureSensorAccordingToEepA51003,
    TemperatureSensorAccordingToEepA51003LimitedTempRange,
    CentralOnWithLatchingOfPriority,
    CentralOffWithLatchingOfPriority,
    DirectionPushButtonForLockingTurnaroundAutomatic,
    CentralUp,
    CentralDown,
    CentralStop,
    DirectionPushButtonForLockingShadingScene1,
    DirectionPushButtonForLockingShadingScene2,
    DirectionPushButtonForLockingShadingScene3,
    DirectionPushButtonForLockingShadingScene4,
    DirectionPushButtonForLocking,
    Fah60WithDaylightEvaluationSwitchOffOnly,
    Fah60WithDaylightEvaluationSwitchOnOnly,
    ScenePushButton,
    Time,
    WindowHandleAccordingToEepA51409,
    WindowHandleAccordingToEepA5140a,
    ResolvePriority,
    WindowHandleAccordingToEepA51409AsNcc,
    WindowHandleAccordingToEepA51409AsNoc,
    WindowHandleAccordingToEepA5140aAsNcc,
    WindowHandleAccordingToEepA5140aAsNoc,
    DrivingCommandWithRunTimeAndReverseTime,
    HeatPump,
    HumidityTemperatureSensorAccordingToEepA50403,
    HumidityTemperatureSensorFuthTempSetpointAccordingToEepA51012Buth,
    VibrationSensorAccordingToEepA51405,
    BrightnessSensorAccordingToEepA50602TwilightSwitch,
    BrightnessSensorAccordingToEepA50603TwilightSwitch,
    CentralOffWithImmediatePriority,
    CentralOnWithImmediatePriority,
    VibrationSensorAccordingToEepA51405WithDelay,
    WindowSensorAccordingToEepA51401,
    WindowSensorAccordingToEepA51403,
    Other(u8),
}

use KeyFunction::*;

const KEY_FUNCTIONS: &[(u8, KeyFunction)] = &[
    (0, NoFunction),
    (1, UniversalPushButton),
    (2, DirectionPushButtonTopOn),
    (3, DirectionPushButtonBottomOn),
    (4, CentralOff),
    (5, CentralOn),
    (6, ScenePushbutton),
    (7, SequentialScenePushButton),
    (8, LightAlarm),
    (10, DimmingValueInPercentage),
    (11, StaircasePushButton),
    (12, CentralUpDown),
    (14, CentralUpDownWithDynamicPriority),
    (16, WindowContact),
    (17, NoWindowContact),
    (18, NcWindowContact),
    (19, CentralUpDownWithStaticPriority),
    (21, CentralOffWithStaticPriority),
    (22, CentralOnWithStaticPriority),
    (23, UniversalPushButtonEs),
    (24, UniversalPushButtonEr),
    (25, WindowHandleFtke),
    (26, NoWindowHandle),
    (27, NcWindowHandle),
    (29, FourFoldTestPushButton),
    (30, FourFoldPushButton),
    (31, OperationsCommandWithTimeValueTransmissionFromController),
    (32, DimmingValueFromController),
    (33, FbhWithBrightnessEvaluation),
    (34, FbhWithoutBrightnessEvaluation),
    (35, MotionDetectorAccordingToEepA50701),
    (36, Fah60WithDaylightEvaluation),
    (37, Fah60TwilightPushButton),
    (38, Fah60TwilightDimmer),
    (39, Fah60ForControlOfRollerShutter),
    (42, Fwg14msWeatherStation),
    (44, Fih65bForConstantLightControl),
    (47, TargetBrightnessMemoryButton),
    (48, WaterSensorAccordingToEepA53030),
    (49, WaterSensorRpsTelegram),
    (50, SmokeDetector),
    (51, SwitchingStateFromController),
    (53, ActivationSnoozeFunction),
    (54, FbhWithBrightnessEvaluationOnlyAtSwitchOnForWarmLight),
    (60, LinkedActuatorFeedback),
    (61, TemperatureControllerWithSetpoint),
    (62, TemperatureControllerWithoutSlideSwitch),
    (63, TemperatureControllerWithSlideSwitchSunMoon),
    (64, TemperatureControllerAccordingEepA51006Ftr55d),
    (65, TemperatureControllerSetpoint),
    (66, TemperatureControllerAccordingEepA50205),
    (67, HumidityTemperatureSensorAccordingToEepA50402),
    (68, TemperatureSensorAccordingToEepA51002),
    (69, HumidityTemperatureSensorFuthAccordingToEepA51012),
    (70, TemperatureSensorAccordingToEepA51003),
    (71, TemperatureSensorAccordingToEepA51003LimitedTempRange),
    (77, CentralOnWithLatchingOfPriority),
    (78, CentralOffWithLatchingOfPriority),
    (80, DirectionPushButtonForLockingTurnaroundAutomatic),
    (82, CentralUp),
    (83, CentralDown),
    (84, CentralStop),
    (98, DirectionPushButtonForLockingShadingScene1),
    (99, DirectionPushButtonForLockingShadingScene2),
    (100, DirectionPushButtonForLockingShadingScene3),
    (101, DirectionPushButtonForLockingShadingScene4),
    (102, DirectionPushButtonForLocking),
    (103, Fah60WithDaylightEvaluationSwitchOffOnly),
    (104, Fah60WithDaylightEvaluationSwitchOnOnly),
    (105, ScenePushButton),
    (110, Time),
    (120, WindowHandleAccordingToEepA51409),
    (121, WindowHandleAccordingToEepA5140a),
    (123, ResolvePriority),
    (124, WindowHandleAccordingToEepA51409AsNcc),
    (125, WindowHandleAccordingToEepA51409AsNoc),
    (126, WindowHandleAccordingToEepA5140aAsNcc),
    (127, WindowHandleAccordingToEepA5140aAsNoc),
    (128, DrivingCommandWithRunTimeAndReverseTime),
    (137, HeatPump),
    (139, HumidityTemperatureSensorAccordingToEepA50403),
    (149, HumidityTemperatureSensorFuthTempSetpointAccordingToEepA51012Buth),
    (156, VibrationSensorAccordingToEepA51405),
    (157, BrightnessSensorAccordingToEepA50602TwilightSwitch),
    (158, BrightnessSensorAccordingToEepA50603TwilightSwitch),
    (159, CentralOffWithImmediatePriority),
    (160, CentralOnWithImmediatePriority),
    (161, VibrationSensorAccordingToEepA51405WithDelay),
    (162, WindowSensorAccordingToEepA51401),
    (163, WindowSensorAccordingToEepA51403),
];

impl KeyFunction {
    pub fn from_code(code: u8) -> Self {
        KEY_FUNCTIONS
            .iter()
            .find(|(c, _)| *c == code)
            .map_or(Other(code), |(_, f)| *f)
    }

    pub fn code(self) -> u8 {
        match self {
            Other(code) => code,
            known => KEY_FUNCTIONS
                .iter()
                .find(|(_, f)| *f == known)
                .map_or(0, |(c, _)| *c),
        }
    }
}

impl From<u8> for KeyFunction {
    fn from(code: u8) -> Self {
        Self::from_code(code)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RockerSide {
    Left,
    Right,
}

impl RockerSide {
    /// Key number of the side in a function-group row.
    const fn key(self) -> u8 {
        match self {
            Self::Left => 5,
            Self::Right => 6,
        }
    }

    fn from_key(key: u8) -> Option<Self> {
        match key {
            5 => Some(Self::Left),
            6 => Some(Self::Right),
            _ => None,
        }
    }

    /// The upper button of a side switches on, the lower one off.
    fn button(self, on: bool) -> RockerButton {
        match (self, on) {
            (Self::Left, true) => RockerButton::AI,
            (Self::Left, false) => RockerButton::A0,
            (Self::Right, true) => RockerButton::BI,
            (Self::Right, false) => RockerButton::B0,
        }
    }
}

/// A radio sender an actuator channel can be programmed to obey.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Source {
    pub sender: RadioId,
    pub profile: Eep,
    /// Rocker side, for rocker profiles.
    pub side: RockerSide,
}

impl Source {
    pub fn rocker(sender: RadioId, side: RockerSide) -> Self {
        Self {
            sender,
            profile: ROCKER,
            side,
        }
    }

    pub fn new(sender: RadioId, profile: Eep) -> Self {
        Self {
            sender,
            profile,
            side: RockerSide::Left,
        }
    }
}

/// Telegrams the host sends to control a programmed actuator channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirectCommand {
    /// Rocker telegrams from `sender` switch the channel.
    Rocker { sender: RadioId, side: RockerSide },
    /// Central command telegrams from `sender` switch or dim the channel.
    Central { sender: RadioId },
}

impl DirectCommand {
    pub fn sender(&self) -> RadioId {
        match *self {
            Self::Rocker { sender, .. } | Self::Central { sender } => sender,
        }
    }

    /// The telegram bringing the channel into `state`.
    ///
    /// Rocker commands take [`Command::Switch`] or a rocker press, central
    /// commands take switching and dimming. The telegram goes out as if it had
    /// been received by radio, which is how actuators on the bus hear senders.
    pub fn telegram(&self, state: &Command) -> Result<Telegram, EncodeError> {
        let radio = match *self {
            Self::Rocker { sender, side } => {
                let command = match *state {
                    Command::Switch { on } => Command::Rocker {
                        button: side.button(on),
                        pressed: true,
                    },
                    other => other,
                };
                let data = eep::encode(ROCKER, &command)?;
                RadioTelegram::rps(sender, data[0], 0x30)
            }
            Self::Central { sender } => {
                RadioTelegram::four_bs(sender, eep::encode(CENTRAL_COMMAND, state)?, 0x00)
            }
        };
        Ok(Telegram::RadioReceived(radio))
    }
}

/// How the channels of an actuator are addressed in its rows.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Style {
    /// Channel bitmask, switched by rocker telegrams.
    Switch,
    /// Channel number, dimmed by central commands.
    Dimmer,
}

/// Where and how a device is programmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Programming {
    pub style: Style,
    /// Rows taking programmed senders.
    pub rows: Range<u8>,
    /// Key function of home automation senders.
    pub function: KeyFunction,
}

impl Programming {
    /// How `device` is programmed, None for devices without programmable rows.
    pub fn of(device: &Device) -> Option<Self> {
        use DeviceType::*;
        let (style, first, last, function) = match device.device_type {
            Fsr14x1 | Fsr14x2 | Fsr14x4 | Fsr14Mx2 | F4sr14Led => {
                (Style::Switch, 12, None, SwitchingStateFromController)
            }
            Fsb14 => (
                Style::Switch,
                17,
                None,
                OperationsCommandWithTimeValueTransmissionFromController,
            ),
            Fmz14 => (Style::Switch, 8, None, SwitchingStateFromController),
            Fae14ssr | Fhk14 | F4hk14 => (Style::Switch, 12, Some(14), TemperatureControllerSetpoint),
            Fud14 | Fud14W800 | Fsg14V10 => (Style::Dimmer, 12, None, DimmingValueFromController),
            Fdg14 | Fd2g14 => (Style::Dimmer, 14, None, DimmingValueFromController),
            _ => return None,
        };
        let end = last
            .unwrap_or(device.memory_size)
            .min(device.memory_size)
            .max(first);
        Some(Self {
            style,
            rows: first..end,
            function,
        })
    }

    fn channels(&self, device: &Device, channel: u8) -> u8 {
        match self.style {
            Style::Switch => 1u8.checked_shl(channel.into()).unwrap_or(0),
            // single channel dimmers keep their ramp speed there
            Style::Dimmer if device.size == 1 => 1,
            Style::Dimmer => channel,
        }
    }

    /// The row making `channel` obey `source`, and its position if that is fixed.
    pub fn row(
        &self,
        device: &Device,
        channel: u8,
        source: &Source,
    ) -> Result<(RowData, Option<u8>), Error> {
        let (key, function, fixed) = match (self.style, source.profile) {
            (_, ROCKER) | (_, ROCKER_UP) => (source.side.key(), DirectionPushButtonBottomOn, None),
            (_, CENTRAL_COMMAND) | (Style::Switch, SHUTTER_COMMAND) => (0, self.function, None),
            (Style::Switch, ROOM_PANEL) => (0, self.function, Some(self.rows.start + channel)),
            (_, profile) => return UnsupportedSourceSnafu { profile }.fail(),
        };
        let [s0, s1, s2, s3] = source.sender.to_bytes();
        let channels = self.channels(device, channel);
        Ok(([s0, s1, s2, s3, key, function.code(), channels, 0], fixed))
    }

    /// The direct command a row programs for `channel`, if any.
    pub fn direct_command(&self, device: &Device, channel: u8, row: &RowData) -> Option<DirectCommand> {
        let sender = RadioId::from_bytes([row[0], row[1], row[2], row[3]]);
        if *sender == 0 || row[6] != self.channels(device, channel) {
            return None;
        }
        match (self.style, KeyFunction::from_code(row[5])) {
            (Style::Switch, DirectionPushButtonBottomOn) => {
                RockerSide::from_key(row[4]).map(|side| DirectCommand::Rocker { sender, side })
            }
            (Style::Dimmer, DimmingValueFromController) => Some(DirectCommand::Central { sender }),
            _ => None,
        }
    }
}

impl MemorySession<'_> {
    fn programming(&self, channel: u8) -> Result<Programming, Error> {
        let device = self.device();
        let programming =
            Programming::of(device).context(NotProgrammableSnafu { device: device.id })?;
        ensure!(
            channel < device.size,
            NoSuchChannelSnafu {
                channel,
                size: device.size
            }
        );
        Ok(programming)
    }

    /// Make `channel` (starting at 0) obey `source`, writing a row unless there is one.
    ///
    /// Returns true if a row was written.
    ///
    /// # Errors
    /// [`Error::MemoryFull`] if no empty row is left,
    /// [`Error::UnsupportedSource`] for a profile the device can't be programmed with.
    pub fn ensure_programmed(&self, channel: u8, source: &Source) -> Result<bool, Error> {
        let programming = self.programming(channel)?;
        let (expected, fixed) = programming.row(self.device(), channel, source)?;
        let target = match fixed {
            Some(row) => (self.read_row(row)? != expected).then(|| row),
            None => {
                let mut empty = None;
                for row in programming.rows.clone() {
                    let data = self.read_row(row)?;
                    if data == expected {
                        debug!("{} obeys {} in row {}", self.device(), source.sender, row);
                        return Ok(false);
                    }
                    if empty.is_none() && data == [0; 8] {
                        empty = Some(row);
                    }
                }
                let address = *self.address();
                Some(empty.context(MemoryFullSnafu { address })?)
            }
        };
        match target {
            Some(row) => {
                info!("Programming {} for {} in row {}", source.sender, self.device(), row);
                self.write_row(row, expected)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The command a programmed row lets the host send to `channel`.
    pub fn find_direct_command(&self, channel: u8) -> Result<Option<DirectCommand>, Error> {
        let programming = self.programming(channel)?;
        for row in programming.rows.clone() {
            let data = self.read_row(row)?;
            if let Some(command) = programming.direct_command(self.device(), channel, &data) {
                return Ok(Some(command));
            }
        }
        Ok(None)
    }

    /// Program `channel` to obey the id the channel reports its status with,
    /// which no radio sender uses, and return the command to send.
    pub fn ensure_direct_command(&self, channel: u8) -> Result<DirectCommand, Error> {
        let programming = self.programming(channel)?;
        let sender = self
            .address()
            .offset(channel)
            .context(NoSuchChannelSnafu {
                channel,
                size: self.device().size,
            })?
            .radio_id();
        let (source, command) = match programming.style {
            Style::Switch => (
                Source::rocker(sender, RockerSide::Left),
                DirectCommand::Rocker {
                    sender,
                    side: RockerSide::Left,
                },
            ),
            Style::Dimmer => (
                Source::new(sender, CENTRAL_COMMAND),
                DirectCommand::Central { sender },
            ),
        };
        self.ensure_programmed(channel, &source)?;
        Ok(command)
    }
}
