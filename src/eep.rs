//! EnOcean equipment profiles (EEP) and the Eltako status profiles.
//!
//! A profile id is a `RORG-FUNC-TYPE` triplet like `A5-02-05`. The registry is a
//! static table mapping profile ids to a decoder (and, for the profiles a bus
//! master sends, an encoder). Decoding is total: every payload of the right width
//! decodes, bit patterns a profile leaves undefined come out as
//! [`Value::OutOfRange`] or [`Value::NotAvailable`].
//!
//! ## Example
//! ```
//! use eltako_bus::eep::{self, Value};
//!
//! let profile = "A5-02-05".parse().unwrap();
//! let reading = eep::decode(profile, &[0x00, 0x00, 0x7f, 0x08]).unwrap();
//! let t = reading.measure("temperature").unwrap();
//! assert!((t - 20.08).abs() < 0.01);
//! ```

use core::fmt;
use core::str::FromStr;

use arrayvec::ArrayVec;
use snafu::{ensure, OptionExt, Snafu};

use crate::telegram::RadioTelegram;
use crate::types;

/// Profile family, the first part of a profile id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rorg {
    /// F6, repeated switch communication
    Rps,
    /// D5, 1 byte communication
    OneBs,
    /// A5, 4 byte communication
    FourBs,
    /// M5, Eltako switch actuator status (RPS encoded)
    SwitchStatus,
    /// G5, Eltako shutter actuator status (RPS encoded)
    ShutterStatus,
    /// H5, Eltako shutter drive command (4BS encoded)
    ShutterCommand,
}

impl Rorg {
    pub const fn code(self) -> &'static str {
        match self {
            Self::Rps => "F6",
            Self::OneBs => "D5",
            Self::FourBs => "A5",
            Self::SwitchStatus => "M5",
            Self::ShutterStatus => "G5",
            Self::ShutterCommand => "H5",
        }
    }

    /// Number of payload bytes telegrams of this family carry.
    pub const fn payload_len(self) -> usize {
        match self {
            Self::Rps | Self::OneBs | Self::SwitchStatus | Self::ShutterStatus => 1,
            Self::FourBs | Self::ShutterCommand => 4,
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        [
            Self::Rps,
            Self::OneBs,
            Self::FourBs,
            Self::SwitchStatus,
            Self::ShutterStatus,
            Self::ShutterCommand,
        ]
        .into_iter()
        .find(|rorg| rorg.code().eq_ignore_ascii_case(code))
    }
}

/// An equipment profile id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eep {
    pub rorg: Rorg,
    pub func: u8,
    pub variant: u8,
}

/// Create a new [`Eep`].
pub const fn eep(rorg: Rorg, func: u8, variant: u8) -> Eep {
    Eep::new(rorg, func, variant)
}

impl Eep {
    pub const fn new(rorg: Rorg, func: u8, variant: u8) -> Self {
        Self {
            rorg,
            func,
            variant,
        }
    }
}

impl fmt::Display for Eep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02X}-{:02X}", self.rorg.code(), self.func, self.variant)
    }
}

impl FromStr for Eep {
    type Err = types::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || types::InvalidProfileSnafu { text: s }.build();
        let mut parts = s.trim().split('-');
        let (rorg, func, variant) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(rorg), Some(func), Some(variant), None) => (rorg, func, variant),
            _ => return Err(invalid()),
        };
        let rorg = Rorg::from_code(rorg).ok_or_else(invalid)?;
        let func = u8::from_str_radix(func, 16).map_err(|_| invalid())?;
        let variant = u8::from_str_radix(variant, 16).map_err(|_| invalid())?;
        Ok(Self::new(rorg, func, variant))
    }
}

/// Error type for decoding
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    #[snafu(display("Unknown equipment profile {eep}"))]
    NotFound { eep: Eep },
    #[snafu(display("{eep} payload is {expected} bytes, got {actual}"))]
    PayloadLength {
        eep: Eep,
        expected: usize,
        actual: usize,
    },
}

/// Error type for encoding
#[derive(Debug, Snafu, Clone, PartialEq)]
#[non_exhaustive]
pub enum EncodeError {
    #[snafu(display("Unknown equipment profile {eep}"))]
    UnknownProfile { eep: Eep },
    #[snafu(display("{eep} can't encode {command:?}"))]
    Unsupported { eep: Eep, command: Command },
    #[snafu(display("{what} {value} outside of {min}..={max}"))]
    ValueRange {
        what: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Unit {
    Celsius,
    Percent,
    Lux,
    Kilolux,
    Volt,
    Ppm,
    MetersPerSecond,
    KilowattHours,
    Watts,
    CubicMeters,
    LitersPerSecond,
    Seconds,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Celsius => "°C",
            Self::Percent => "%",
            Self::Lux => "lx",
            Self::Kilolux => "klx",
            Self::Volt => "V",
            Self::Ppm => "ppm",
            Self::MetersPerSecond => "m/s",
            Self::KilowattHours => "kWh",
            Self::Watts => "W",
            Self::CubicMeters => "m³",
            Self::LitersPerSecond => "l/s",
            Self::Seconds => "s",
        })
    }
}

/// One decoded field.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    /// A physical quantity.
    Measure(f64, Unit),
    Flag(bool),
    /// One of a fixed set of states.
    State(&'static str),
    /// A raw count or level without physical unit.
    Count(u32),
    /// The sender marks this field as not available.
    NotAvailable,
    /// The raw value is outside of what the profile defines.
    OutOfRange,
}

impl Value {
    /// The numeric content, if there is one.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Measure(v, _) => Some(v),
            Self::Count(c) => Some(f64::from(c)),
            Self::Flag(b) => Some(if b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measure(v, unit) => write!(f, "{:.2} {}", v, unit),
            Self::Flag(b) => write!(f, "{}", b),
            Self::State(s) => f.write_str(s),
            Self::Count(c) => write!(f, "{}", c),
            Self::NotAvailable => f.write_str("n/a"),
            Self::OutOfRange => f.write_str("out of range"),
        }
    }
}

/// Most fields any profile decodes into.
pub const MAX_FIELDS: usize = 10;

/// Named fields decoded from one payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reading {
    fields: ArrayVec<(&'static str, Value), MAX_FIELDS>,
}

impl Reading {
    fn new() -> Self {
        Self::default()
    }

    fn with(mut self, name: &'static str, value: Value) -> Self {
        self.fields.push((name, value)); // push panics on overflow
        self
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    /// The numeric content of a field, if present and available.
    pub fn measure(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Value)> + '_ {
        self.fields.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

/// State reported by the status code of an Eltako actuator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ActuatorState {
    On,
    Off,
    MovingUp,
    MovingDown,
    /// Shutter reached its upper end position.
    Top,
    /// Shutter reached its lower end position.
    Bottom,
    Unknown(u8),
}

impl ActuatorState {
    fn value(self) -> Value {
        match self {
            Self::On => Value::State("on"),
            Self::Off => Value::State("off"),
            Self::MovingUp => Value::State("moving up"),
            Self::MovingDown => Value::State("moving down"),
            Self::Top => Value::State("top"),
            Self::Bottom => Value::State("bottom"),
            Self::Unknown(_) => Value::OutOfRange,
        }
    }
}

const STATUS_CODES: &[(Rorg, u8, ActuatorState)] = &[
    (Rorg::SwitchStatus, 0x70, ActuatorState::On),
    (Rorg::SwitchStatus, 0x50, ActuatorState::Off),
    (Rorg::ShutterStatus, 0x01, ActuatorState::MovingUp),
    (Rorg::ShutterStatus, 0x02, ActuatorState::MovingDown),
    (Rorg::ShutterStatus, 0x70, ActuatorState::Top),
    (Rorg::ShutterStatus, 0x50, ActuatorState::Bottom),
];

/// Look up the state a status profile reports with `code`.
pub fn decode_status(eep: Eep, code: u8) -> ActuatorState {
    STATUS_CODES
        .iter()
        .find(|(rorg, c, _)| *rorg == eep.rorg && *c == code)
        .map_or(ActuatorState::Unknown(code), |(_, _, state)| *state)
}

/// Rocker of a two-rocker switch, with the side pressed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum RockerButton {
    AI = 0,
    A0 = 1,
    BI = 2,
    B0 = 3,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutterDirection {
    Stop = 0,
    Up = 1,
    Down = 2,
}

/// Something to tell a device, encoded by the profile the device listens to.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Command {
    /// Press or release a rocker (F6-02-01, F6-02-02).
    Rocker { button: RockerButton, pressed: bool },
    /// Switch an actuator (A5-38-08).
    Switch { on: bool },
    /// Dim to `value` percent, taking `ramp_seconds` for the full range (A5-38-08).
    Dim { value: u8, ramp_seconds: u8 },
    /// Room panel set point and measured temperature in °C (A5-10-06).
    SetTemperature { target: f64, current: f64 },
    /// Drive a shutter for `seconds` (H5-3F-7F).
    Shutter {
        direction: ShutterDirection,
        seconds: u8,
    },
    /// Valve set point and room temperature in °C (A5-20-01).
    Valve { set_point: f64, room_temperature: f64 },
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum Codec {
    Temperature { min: f64, max: f64 },
    Temperature10Bit { min: f64, max: f64 },
    TempHumidity { min: f64, max: f64 },
    TempHumidity10Bit,
    Illumination { ill1: (f64, f64), ill2: (f64, f64) },
    Illumination10Bit,
    Occupancy,
    Presence,
    LightTempOccupancy,
    Co2,
    RoomPanel { fan: bool },
    RoomPanelDayNight,
    RoomPanelHumidity,
    Meter {
        cumulative: (&'static str, Unit),
        current: (&'static str, Unit),
    },
    Weather,
    WindowHandle { vibration: bool },
    Valve,
    DigitalInput,
    CentralCommand,
    ShutterCommand,
    PushButton,
    Rocker,
    KeyCard,
    Leakage,
    Handle,
    Contact,
    ActuatorStatus,
}

/// Registry entry for one profile.
#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentProfile {
    eep: Eep,
    title: &'static str,
    codec: Codec,
}

impl EquipmentProfile {
    pub fn eep(&self) -> Eep {
        self.eep
    }

    pub fn title(&self) -> &'static str {
        self.title
    }

    /// Telegrams of this profile are events (a button press), not the state of a device.
    pub fn is_transient(&self) -> bool {
        matches!(self.codec, Codec::Rocker | Codec::PushButton)
    }

    /// Whether [`encode`](Self::encode) supports any command.
    pub fn can_encode(&self) -> bool {
        matches!(
            self.codec,
            Codec::Rocker
                | Codec::CentralCommand
                | Codec::RoomPanelDayNight
                | Codec::ShutterCommand
                | Codec::Valve
        )
    }

    /// Decode a payload, one byte for RPS style families, four for 4BS style ones.
    pub fn decode(&self, payload: &[u8]) -> Result<Reading, DecodeError> {
        let expected = self.eep.rorg.payload_len();
        ensure!(
            payload.len() == expected,
            PayloadLengthSnafu {
                eep: self.eep,
                expected,
                actual: payload.len(),
            }
        );
        let mut data = [0u8; 4];
        data[..expected].copy_from_slice(payload);
        Ok(self.codec.decode(self.eep, data))
    }

    /// Encode a command into radio telegram data bytes.
    pub fn encode(&self, command: &Command) -> Result<[u8; 4], EncodeError> {
        match (self.codec, *command) {
            (Codec::Rocker, Command::Rocker { button, pressed }) => {
                let db0 = if pressed { ((button as u8) << 5) | 0x10 } else { 0 };
                Ok([db0, 0, 0, 0])
            }
            (Codec::CentralCommand, Command::Switch { on }) => Ok([0x01, 0, 0, 0x08 | u8::from(on)]),
            (Codec::CentralCommand, Command::Dim { value, ramp_seconds }) => {
                ensure!(
                    value <= 100,
                    ValueRangeSnafu {
                        what: "dim value",
                        value: f64::from(value),
                        min: 0.0,
                        max: 100.0,
                    }
                );
                Ok([0x02, value, ramp_seconds.max(1), 0x08 | u8::from(value > 0)])
            }
            (Codec::RoomPanelDayNight, Command::SetTemperature { target, current }) => {
                let set_point = to_raw("set point", target, 0.0, 40.0)?;
                let current = to_raw("temperature", current, 0.0, 40.0)?;
                Ok([0, set_point, 255 - current, 0x09])
            }
            (Codec::ShutterCommand, Command::Shutter { direction, seconds }) => {
                Ok([0, seconds, direction as u8, 0x08])
            }
            (
                Codec::Valve,
                Command::Valve {
                    set_point,
                    room_temperature,
                },
            ) => {
                let set_point = to_raw("set point", set_point, 0.0, 40.0)?;
                let room = to_raw("room temperature", room_temperature, 0.0, 40.0)?;
                Ok([set_point, 255 - room, 0x04, 0x08])
            }
            _ => UnsupportedSnafu {
                eep: self.eep,
                command: *command,
            }
            .fail(),
        }
    }
}

/// Scale `value` in `min..=max` to 0..=255.
fn to_raw(what: &'static str, value: f64, min: f64, max: f64) -> Result<u8, EncodeError> {
    ensure!(
        value.is_finite() && (min..=max).contains(&value),
        ValueRangeSnafu {
            what,
            value,
            min,
            max,
        }
    );
    Ok(((value - min) / (max - min) * 255.0).round() as u8)
}

fn linear(raw: u32, raw_max: u32, min: f64, max: f64) -> f64 {
    min + (max - min) * f64::from(raw) / f64::from(raw_max)
}

fn measure(raw: u32, raw_max: u32, min: f64, max: f64, unit: Unit) -> Value {
    Value::Measure(linear(raw, raw_max, min, max), unit)
}

/// Like [`measure`], raw values above `raw_max` are invalid.
fn bounded(raw: u32, raw_max: u32, min: f64, max: f64, unit: Unit) -> Value {
    if raw > raw_max {
        Value::OutOfRange
    } else {
        measure(raw, raw_max, min, max, unit)
    }
}

fn flag(byte: u8, mask: u8) -> Value {
    Value::Flag(byte & mask != 0)
}

impl Codec {
    fn decode(self, eep: Eep, data: [u8; 4]) -> Reading {
        // 4BS wire order; for single byte profiles db0 is data[0]
        let [db3, db2, db1, db0] = data.map(u32::from);
        let byte = data[0];
        let r = Reading::new();
        match self {
            Self::Temperature { min, max } => {
                r.with("temperature", measure(255 - db1, 255, min, max, Unit::Celsius))
            }
            Self::Temperature10Bit { min, max } => {
                let raw = ((db2 & 0x03) << 8) | db1;
                r.with("temperature", measure(1023 - raw, 1023, min, max, Unit::Celsius))
            }
            Self::TempHumidity { min, max } => r
                .with("humidity", bounded(db2, 250, 0.0, 100.0, Unit::Percent))
                .with("temperature", measure(db1, 255, min, max, Unit::Celsius)),
            Self::TempHumidity10Bit => {
                let raw = ((db2 & 0x03) << 8) | db1;
                r.with("humidity", measure(db3, 255, 0.0, 100.0, Unit::Percent))
                    .with("temperature", measure(raw, 1023, -20.0, 60.0, Unit::Celsius))
            }
            Self::Illumination { ill1, ill2 } => {
                let illumination = if db0 & 0x01 == 0 {
                    measure(db1, 255, ill1.0, ill1.1, Unit::Lux)
                } else {
                    measure(db2, 255, ill2.0, ill2.1, Unit::Lux)
                };
                r.with("supply_voltage", measure(db3, 255, 0.0, 5.1, Unit::Volt))
                    .with("illumination", illumination)
            }
            Self::Illumination10Bit => {
                let raw = (db2 << 2) | (db1 >> 6);
                r.with("supply_voltage", bounded(db3, 250, 0.0, 5.0, Unit::Volt))
                    .with("illumination", bounded(raw, 1000, 0.0, 1000.0, Unit::Lux))
            }
            Self::Occupancy => {
                let voltage = if db0 & 0x01 != 0 {
                    bounded(db3, 250, 0.0, 5.0, Unit::Volt)
                } else {
                    Value::NotAvailable
                };
                r.with("supply_voltage", voltage)
                    .with("motion", Value::Flag(db1 >= 128))
            }
            Self::Presence => r
                .with("supply_voltage", bounded(db3, 250, 0.0, 5.0, Unit::Volt))
                .with("presence", flag(data[3], 0x80)),
            Self::LightTempOccupancy => r
                .with("supply_voltage", measure(db3, 255, 0.0, 5.1, Unit::Volt))
                .with("illumination", measure(db2, 255, 0.0, 510.0, Unit::Lux))
                .with("temperature", measure(db1, 255, 0.0, 51.0, Unit::Celsius))
                .with("motion", Value::Flag(db0 & 0x02 == 0))
                .with("occupancy_button", Value::Flag(db0 & 0x01 == 0)),
            Self::Co2 => {
                let humidity = if db0 & 0x04 != 0 {
                    bounded(db3, 200, 0.0, 100.0, Unit::Percent)
                } else {
                    Value::NotAvailable
                };
                let temperature = if db0 & 0x02 != 0 {
                    measure(db1, 255, 0.0, 51.0, Unit::Celsius)
                } else {
                    Value::NotAvailable
                };
                r.with("humidity", humidity)
                    .with("co2", measure(db2, 255, 0.0, 2550.0, Unit::Ppm))
                    .with("temperature", temperature)
            }
            Self::RoomPanel { fan } => {
                let r = if fan {
                    r.with(
                        "fan_speed",
                        Value::State(match db3 {
                            210..=255 => "auto",
                            190..=209 => "0",
                            165..=189 => "1",
                            145..=164 => "2",
                            _ => "3",
                        }),
                    )
                } else {
                    r
                };
                let r = r
                    .with("set_point", Value::Count(db2))
                    .with("temperature", measure(255 - db1, 255, 0.0, 40.0, Unit::Celsius));
                if fan {
                    r.with("slide_switch", flag(data[3], 0x01))
                } else {
                    r
                }
            }
            Self::RoomPanelDayNight => r
                .with("set_point", measure(db2, 255, 0.0, 40.0, Unit::Celsius))
                .with("temperature", measure(255 - db1, 255, 0.0, 40.0, Unit::Celsius))
                .with("day", flag(data[3], 0x01)),
            Self::RoomPanelHumidity => r
                .with("set_point", Value::Count(db3))
                .with("humidity", bounded(db2, 250, 0.0, 100.0, Unit::Percent))
                .with("temperature", bounded(db1, 250, 0.0, 40.0, Unit::Celsius)),
            Self::Meter {
                cumulative,
                current,
            } => {
                let raw = (db3 << 16) | (db2 << 8) | db1;
                if db0 == 0x8f {
                    // serial number fragment, Eltako meters send it with tariff 8
                    return r.with("serial_part", Value::Count(raw));
                }
                let divisor = 10u32.pow(db0 & 0x03);
                let (name, unit) = if db0 & 0x04 != 0 { current } else { cumulative };
                r.with("tariff", Value::Count(db0 >> 4))
                    .with(name, Value::Measure(f64::from(raw) / f64::from(divisor), unit))
            }
            Self::Weather => match db0 >> 4 {
                1 => r
                    .with("dawn", measure(db3, 255, 0.0, 999.0, Unit::Lux))
                    .with("temperature", measure(db2, 255, -40.0, 80.0, Unit::Celsius))
                    .with("wind_speed", measure(db1, 255, 0.0, 70.0, Unit::MetersPerSecond))
                    .with("night", flag(data[3], 0x04))
                    .with("rain", flag(data[3], 0x02)),
                2 => r
                    .with("sun_west", measure(db3, 255, 0.0, 150.0, Unit::Kilolux))
                    .with("sun_south", measure(db2, 255, 0.0, 150.0, Unit::Kilolux))
                    .with("sun_east", measure(db1, 255, 0.0, 150.0, Unit::Kilolux))
                    .with(
                        "hemisphere",
                        Value::State(if db0 & 0x04 != 0 { "south" } else { "north" }),
                    ),
                _ => r.with("identifier", Value::OutOfRange),
            },
            Self::WindowHandle { vibration } => {
                let window = match (db0 >> 1) & 0x03 {
                    0 => Value::State("closed"),
                    1 => Value::State("tilted"),
                    2 => Value::State("open"),
                    _ => Value::OutOfRange,
                };
                let r = r
                    .with("supply_voltage", bounded(db3, 250, 0.0, 5.0, Unit::Volt))
                    .with("window", window);
                if vibration {
                    r.with("vibration", flag(data[3], 0x01))
                } else {
                    r
                }
            }
            Self::Valve => {
                let flags = data[1];
                r.with("position", bounded(db3, 100, 0.0, 100.0, Unit::Percent))
                    .with("service_on", flag(flags, 0x80))
                    .with("energy_input", flag(flags, 0x40))
                    .with("energy_storage", flag(flags, 0x20))
                    .with("battery_low", flag(flags, 0x10))
                    .with("cover_open", flag(flags, 0x08))
                    .with("sensor_failure", flag(flags, 0x04))
                    .with("window_open", flag(flags, 0x02))
                    .with("actuator_obstructed", flag(flags, 0x01))
                    .with("temperature", measure(db1, 255, 0.0, 40.0, Unit::Celsius))
            }
            Self::DigitalInput => {
                let inputs = data[2];
                r.with("temperature", measure(255 - db2, 255, 0.0, 40.0, Unit::Celsius))
                    .with("wake", flag(inputs, 0x10))
                    .with("input_0", flag(inputs, 0x01))
                    .with("input_1", flag(inputs, 0x02))
                    .with("input_2", flag(inputs, 0x04))
                    .with("input_3", flag(inputs, 0x08))
            }
            Self::CentralCommand => match db3 {
                1 => r
                    .with("command", Value::State("switching"))
                    .with("on", flag(data[3], 0x01))
                    .with(
                        "duration",
                        Value::Measure(f64::from((db2 << 8) | db1) / 10.0, Unit::Seconds),
                    )
                    .with("locked", flag(data[3], 0x04)),
                2 => r
                    .with("command", Value::State("dimming"))
                    .with("on", flag(data[3], 0x01))
                    .with("dim", Value::Count(db2))
                    .with("ramp", Value::Measure(f64::from(db1), Unit::Seconds))
                    .with("relative", flag(data[3], 0x04)),
                _ => r.with("command", Value::OutOfRange),
            },
            Self::ShutterCommand => {
                let command = match db1 {
                    0 => Value::State("stop"),
                    1 => Value::State("up"),
                    2 => Value::State("down"),
                    _ => Value::OutOfRange,
                };
                let duration = if db0 & 0x02 != 0 {
                    f64::from((db3 << 8) | db2) / 10.0
                } else {
                    f64::from(db2)
                };
                r.with("command", command)
                    .with("duration", Value::Measure(duration, Unit::Seconds))
                    .with("locked", flag(data[3], 0x04))
            }
            Self::PushButton => r.with("pressed", flag(byte, 0x08)),
            Self::Rocker => {
                let button = if byte == 0 {
                    Value::NotAvailable
                } else {
                    match byte >> 5 {
                        0 => Value::State("AI"),
                        1 => Value::State("A0"),
                        2 => Value::State("BI"),
                        3 => Value::State("B0"),
                        _ => Value::OutOfRange,
                    }
                };
                let second = if byte & 0x01 != 0 {
                    match (byte >> 1) & 0x07 {
                        0 => Value::State("AI"),
                        1 => Value::State("A0"),
                        2 => Value::State("BI"),
                        3 => Value::State("B0"),
                        _ => Value::OutOfRange,
                    }
                } else {
                    Value::NotAvailable
                };
                r.with("button", button)
                    .with("pressed", flag(byte, 0x10))
                    .with("second_button", second)
            }
            Self::KeyCard => r.with(
                "inserted",
                match byte {
                    0x70 => Value::Flag(true),
                    0x00 => Value::Flag(false),
                    _ => Value::OutOfRange,
                },
            ),
            Self::Leakage => r.with(
                "leak",
                match byte {
                    0x11 => Value::Flag(true),
                    0x00 => Value::Flag(false),
                    _ => Value::OutOfRange,
                },
            ),
            Self::Handle => r.with(
                "handle",
                match byte & 0xf0 {
                    0xc0 | 0xe0 => Value::State("open"),
                    0xf0 => Value::State("closed"),
                    0xd0 => Value::State("tilted"),
                    _ => Value::OutOfRange,
                },
            ),
            Self::Contact => r.with(
                "contact",
                Value::State(if byte & 0x01 != 0 { "closed" } else { "open" }),
            ),
            Self::ActuatorStatus => r.with("state", decode_status(eep, byte).value()),
        }
    }
}

macro_rules! profile {
    ($rorg:ident, $func:expr, $variant:expr, $title:expr, $codec:expr) => {
        EquipmentProfile {
            eep: eep(Rorg::$rorg, $func, $variant),
            title: $title,
            codec: $codec,
        }
    };
}

macro_rules! temperature {
    ($variant:expr, $min:expr, $max:expr) => {
        profile!(
            FourBs,
            0x02,
            $variant,
            concat!("Temperature sensor ", stringify!($min), " to ", stringify!($max), " °C"),
            Codec::Temperature {
                min: $min,
                max: $max
            }
        )
    };
}

static PROFILES: &[EquipmentProfile] = &[
    profile!(Rps, 0x01, 0x01, "Push button", Codec::PushButton),
    profile!(Rps, 0x02, 0x01, "Light and blind control, application style 1", Codec::Rocker),
    profile!(Rps, 0x02, 0x02, "Light and blind control, application style 2", Codec::Rocker),
    profile!(Rps, 0x04, 0x01, "Key card activated switch", Codec::KeyCard),
    profile!(Rps, 0x05, 0x01, "Liquid leakage sensor", Codec::Leakage),
    profile!(Rps, 0x10, 0x00, "Window handle", Codec::Handle),
    profile!(OneBs, 0x00, 0x01, "Single input contact", Codec::Contact),
    temperature!(0x01, -40.0, 0.0),
    temperature!(0x02, -30.0, 10.0),
    temperature!(0x03, -20.0, 20.0),
    temperature!(0x04, -10.0, 30.0),
    temperature!(0x05, 0.0, 40.0),
    temperature!(0x06, 10.0, 50.0),
    temperature!(0x07, 20.0, 60.0),
    temperature!(0x08, 30.0, 70.0),
    temperature!(0x09, 40.0, 80.0),
    temperature!(0x0a, 50.0, 90.0),
    temperature!(0x0b, 60.0, 100.0),
    temperature!(0x10, -60.0, 20.0),
    temperature!(0x11, -50.0, 30.0),
    temperature!(0x12, -40.0, 40.0),
    temperature!(0x13, -30.0, 50.0),
    temperature!(0x14, -20.0, 60.0),
    temperature!(0x15, -10.0, 70.0),
    temperature!(0x16, 0.0, 80.0),
    temperature!(0x17, 10.0, 90.0),
    temperature!(0x18, 20.0, 100.0),
    temperature!(0x19, 30.0, 110.0),
    temperature!(0x1a, 40.0, 120.0),
    temperature!(0x1b, 50.0, 130.0),
    profile!(
        FourBs,
        0x02,
        0x20,
        "Temperature sensor 10 bit -10 to 41.2 °C",
        Codec::Temperature10Bit {
            min: -10.0,
            max: 41.2
        }
    ),
    profile!(
        FourBs,
        0x02,
        0x30,
        "Temperature sensor 10 bit -40 to 62.3 °C",
        Codec::Temperature10Bit {
            min: -40.0,
            max: 62.3
        }
    ),
    profile!(
        FourBs,
        0x04,
        0x01,
        "Temperature and humidity sensor 0 to 40 °C",
        Codec::TempHumidity {
            min: 0.0,
            max: 40.0
        }
    ),
    profile!(
        FourBs,
        0x04,
        0x02,
        "Temperature and humidity sensor -20 to 60 °C",
        Codec::TempHumidity {
            min: -20.0,
            max: 60.0
        }
    ),
    profile!(
        FourBs,
        0x04,
        0x03,
        "Temperature and humidity sensor 10 bit -20 to 60 °C",
        Codec::TempHumidity10Bit
    ),
    profile!(
        FourBs,
        0x06,
        0x01,
        "Light sensor 300 to 60000 lx",
        Codec::Illumination {
            ill1: (600.0, 60000.0),
            ill2: (300.0, 30000.0)
        }
    ),
    profile!(
        FourBs,
        0x06,
        0x02,
        "Light sensor 0 to 1020 lx",
        Codec::Illumination {
            ill1: (0.0, 1020.0),
            ill2: (0.0, 510.0)
        }
    ),
    profile!(FourBs, 0x06, 0x03, "Light sensor 10 bit 0 to 1000 lx", Codec::Illumination10Bit),
    profile!(FourBs, 0x07, 0x01, "Occupancy sensor", Codec::Occupancy),
    profile!(FourBs, 0x07, 0x02, "Occupancy sensor with presence", Codec::Presence),
    profile!(
        FourBs,
        0x08,
        0x01,
        "Light, temperature and occupancy sensor",
        Codec::LightTempOccupancy
    ),
    profile!(FourBs, 0x09, 0x04, "CO2 sensor", Codec::Co2),
    profile!(
        FourBs,
        0x10,
        0x02,
        "Room operating panel with fan speed, set point and slide switch",
        Codec::RoomPanel { fan: true }
    ),
    profile!(
        FourBs,
        0x10,
        0x03,
        "Room operating panel with set point",
        Codec::RoomPanel { fan: false }
    ),
    profile!(
        FourBs,
        0x10,
        0x06,
        "Room operating panel with set point and day/night switch",
        Codec::RoomPanelDayNight
    ),
    profile!(
        FourBs,
        0x10,
        0x12,
        "Room operating panel with humidity and set point",
        Codec::RoomPanelHumidity
    ),
    profile!(
        FourBs,
        0x12,
        0x01,
        "Electricity meter",
        Codec::Meter {
            cumulative: ("energy", Unit::KilowattHours),
            current: ("power", Unit::Watts)
        }
    ),
    profile!(
        FourBs,
        0x12,
        0x02,
        "Gas meter",
        Codec::Meter {
            cumulative: ("volume", Unit::CubicMeters),
            current: ("flow", Unit::LitersPerSecond)
        }
    ),
    profile!(
        FourBs,
        0x12,
        0x03,
        "Water meter",
        Codec::Meter {
            cumulative: ("volume", Unit::CubicMeters),
            current: ("flow", Unit::LitersPerSecond)
        }
    ),
    profile!(FourBs, 0x13, 0x01, "Weather station", Codec::Weather),
    profile!(
        FourBs,
        0x14,
        0x09,
        "Window handle status",
        Codec::WindowHandle { vibration: false }
    ),
    profile!(
        FourBs,
        0x14,
        0x0a,
        "Window handle status with vibration alarm",
        Codec::WindowHandle { vibration: true }
    ),
    profile!(FourBs, 0x20, 0x01, "Battery powered valve actuator", Codec::Valve),
    profile!(FourBs, 0x30, 0x03, "Digital inputs with wake and temperature", Codec::DigitalInput),
    profile!(FourBs, 0x38, 0x08, "Central command, gateway", Codec::CentralCommand),
    profile!(ShutterCommand, 0x3f, 0x7f, "Eltako shutter command", Codec::ShutterCommand),
    profile!(SwitchStatus, 0x38, 0x08, "Eltako switch status", Codec::ActuatorStatus),
    profile!(ShutterStatus, 0x3f, 0x7f, "Eltako shutter status", Codec::ActuatorStatus),
];

/// All registered profiles.
pub fn profiles() -> impl Iterator<Item = &'static EquipmentProfile> {
    PROFILES.iter()
}

/// Find the registry entry for a profile id.
pub fn lookup(eep: Eep) -> Result<&'static EquipmentProfile, DecodeError> {
    PROFILES
        .iter()
        .find(|p| p.eep == eep)
        .context(NotFoundSnafu { eep })
}

/// Decode a payload of profile `eep`.
pub fn decode(eep: Eep, payload: &[u8]) -> Result<Reading, DecodeError> {
    lookup(eep)?.decode(payload)
}

/// Decode the payload bytes of a radio or bus status telegram as profile `eep`.
pub fn decode_radio(eep: Eep, telegram: &RadioTelegram) -> Result<Reading, DecodeError> {
    decode(eep, &telegram.data[..eep.rorg.payload_len()])
}

/// Encode a command for a device listening to profile `eep`.
pub fn encode(eep: Eep, command: &Command) -> Result<[u8; 4], EncodeError> {
    PROFILES
        .iter()
        .find(|p| p.eep == eep)
        .context(UnknownProfileSnafu { eep })?
        .encode(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 0.01
    }

    fn a5(func: u8, variant: u8) -> Eep {
        eep(Rorg::FourBs, func, variant)
    }

    #[test]
    fn test_profile_ids() {
        let e: Eep = "A5-02-05".parse().unwrap();
        assert_eq!(e, a5(0x02, 0x05));
        assert_eq!(e.to_string(), "A5-02-05");
        assert_eq!("m5-38-08".parse::<Eep>().unwrap(), eep(Rorg::SwitchStatus, 0x38, 0x08));
        assert!("A5-02".parse::<Eep>().is_err());
        assert!("A5-02-05-01".parse::<Eep>().is_err());
        assert!("X5-02-05".parse::<Eep>().is_err());
        assert!("A5-02-GG".parse::<Eep>().is_err());
    }

    #[test]
    fn test_registry_is_unique() {
        for (i, p) in PROFILES.iter().enumerate() {
            assert!(
                PROFILES[i + 1..].iter().all(|q| q.eep != p.eep),
                "{} registered twice",
                p.eep
            );
        }
        assert!(PROFILES.len() > 50);
    }

    #[test]
    fn test_decoding_is_total() {
        let patterns: [u8; 8] = [0x00, 0x01, 0x08, 0x0f, 0x7f, 0x80, 0xfa, 0xff];
        for p in profiles() {
            let len = p.eep().rorg.payload_len();
            for a in patterns {
                for b in patterns {
                    let payload = [a, b, b, a];
                    let reading = p.decode(&payload[..len]).unwrap();
                    assert!(!reading.is_empty(), "{}", p.eep());
                }
            }
        }
    }

    #[test]
    fn test_payload_length() {
        assert_eq!(
            decode(a5(0x02, 0x05), &[0x00]),
            Err(DecodeError::PayloadLength {
                eep: a5(0x02, 0x05),
                expected: 4,
                actual: 1
            })
        );
        assert_eq!(
            decode(a5(0x02, 0x0c), &[0; 4]),
            Err(DecodeError::NotFound { eep: a5(0x02, 0x0c) })
        );
    }

    #[test]
    fn test_temperature() {
        let e = a5(0x02, 0x05);
        let t = |db1| decode(e, &[0, 0, db1, 0x08]).unwrap().measure("temperature").unwrap();
        assert!(close(t(0xff), 0.0));
        assert!(close(t(0x00), 40.0));
        assert!(close(t(0x7f), 20.078));

        let t = decode(a5(0x02, 0x01), &[0, 0, 0x00, 0x08]).unwrap();
        assert!(close(t.measure("temperature").unwrap(), 0.0));
    }

    #[test]
    fn test_temperature_humidity() {
        let r = decode(a5(0x04, 0x01), &[0, 125, 0xff, 0x0f]).unwrap();
        assert!(close(r.measure("humidity").unwrap(), 50.0));
        assert!(close(r.measure("temperature").unwrap(), 40.0));

        let r = decode(a5(0x04, 0x02), &[0, 251, 0x00, 0x0f]).unwrap();
        assert_eq!(r.get("humidity"), Some(Value::OutOfRange));
        assert!(close(r.measure("temperature").unwrap(), -20.0));
    }

    #[test]
    fn test_sentinels() {
        let r = decode(a5(0x09, 0x04), &[100, 40, 128, 0x08]).unwrap();
        assert_eq!(r.get("humidity"), Some(Value::NotAvailable));
        assert_eq!(r.get("temperature"), Some(Value::NotAvailable));
        assert!(close(r.measure("co2").unwrap(), 400.0));

        let r = decode(a5(0x14, 0x09), &[0, 0, 0, 0x0e]).unwrap();
        assert_eq!(r.get("window"), Some(Value::OutOfRange));
    }

    #[test]
    fn test_meter() {
        let e = a5(0x12, 0x01);
        // 1234.5 kWh cumulative, tariff 0, divisor 10
        let r = decode(e, &[0x00, 0x30, 0x39, 0x09]).unwrap();
        assert!(close(r.measure("energy").unwrap(), 1234.5));
        // current power
        let r = decode(e, &[0x00, 0x01, 0xf4, 0x0c]).unwrap();
        assert!(close(r.measure("power").unwrap(), 500.0));
        assert_eq!(r.get("energy"), None);
        let r = decode(e, &[0x12, 0x34, 0x00, 0x8f]).unwrap();
        assert_eq!(r.get("serial_part"), Some(Value::Count(0x123400)));
    }

    #[test]
    fn test_status_codes() {
        let switch = eep(Rorg::SwitchStatus, 0x38, 0x08);
        let shutter = eep(Rorg::ShutterStatus, 0x3f, 0x7f);
        assert_eq!(decode_status(switch, 0x70), ActuatorState::On);
        assert_eq!(decode_status(switch, 0x50), ActuatorState::Off);
        assert_eq!(decode_status(switch, 0x01), ActuatorState::Unknown(0x01));
        assert_eq!(decode_status(shutter, 0x01), ActuatorState::MovingUp);
        assert_eq!(decode_status(shutter, 0x02), ActuatorState::MovingDown);
        assert_eq!(decode_status(shutter, 0x70), ActuatorState::Top);
        assert_eq!(decode_status(shutter, 0x50), ActuatorState::Bottom);
        assert_eq!(decode_status(a5(0x02, 0x05), 0x70), ActuatorState::Unknown(0x70));

        let r = decode(switch, &[0x70]).unwrap();
        assert_eq!(r.get("state"), Some(Value::State("on")));
        let r = decode(shutter, &[0x33]).unwrap();
        assert_eq!(r.get("state"), Some(Value::OutOfRange));
    }

    #[test]
    fn test_rocker() {
        let e = eep(Rorg::Rps, 0x02, 0x01);
        assert!(lookup(e).unwrap().is_transient());
        assert!(!lookup(a5(0x02, 0x05)).unwrap().is_transient());

        let r = decode(e, &[0x30]).unwrap();
        assert_eq!(r.get("button"), Some(Value::State("A0")));
        assert_eq!(r.get("pressed"), Some(Value::Flag(true)));
        let r = decode(e, &[0x00]).unwrap();
        assert_eq!(r.get("button"), Some(Value::NotAvailable));
        assert_eq!(r.get("pressed"), Some(Value::Flag(false)));

        let pressed = Command::Rocker {
            button: RockerButton::B0,
            pressed: true,
        };
        assert_eq!(encode(e, &pressed), Ok([0x70, 0, 0, 0]));
    }

    #[test]
    fn test_central_command() {
        let e = a5(0x38, 0x08);
        let data = encode(e, &Command::Switch { on: true }).unwrap();
        assert_eq!(data, [0x01, 0, 0, 0x09]);
        let r = decode(e, &data).unwrap();
        assert_eq!(r.get("on"), Some(Value::Flag(true)));

        let data = encode(
            e,
            &Command::Dim {
                value: 40,
                ramp_seconds: 0,
            },
        )
        .unwrap();
        assert_eq!(data, [0x02, 40, 1, 0x09]);
        let r = decode(e, &data).unwrap();
        assert_eq!(r.get("command"), Some(Value::State("dimming")));
        assert_eq!(r.get("dim"), Some(Value::Count(40)));

        assert!(matches!(
            encode(
                e,
                &Command::Dim {
                    value: 101,
                    ramp_seconds: 1
                }
            ),
            Err(EncodeError::ValueRange { .. })
        ));
    }

    #[test]
    fn test_set_temperature() {
        let e = a5(0x10, 0x06);
        let data = encode(
            e,
            &Command::SetTemperature {
                target: 20.0,
                current: 10.0,
            },
        )
        .unwrap();
        let r = decode(e, &data).unwrap();
        assert!((r.measure("set_point").unwrap() - 20.0).abs() < 0.1);
        assert!((r.measure("temperature").unwrap() - 10.0).abs() < 0.1);
        assert_eq!(r.get("day"), Some(Value::Flag(true)));

        let too_hot = Command::SetTemperature {
            target: 45.0,
            current: 10.0,
        };
        assert!(matches!(encode(e, &too_hot), Err(EncodeError::ValueRange { .. })));
    }

    #[test]
    fn test_shutter_and_valve() {
        let shutter = eep(Rorg::ShutterCommand, 0x3f, 0x7f);
        let data = encode(
            shutter,
            &Command::Shutter {
                direction: ShutterDirection::Down,
                seconds: 30,
            },
        )
        .unwrap();
        let r = decode(shutter, &data).unwrap();
        assert_eq!(r.get("command"), Some(Value::State("down")));
        assert!(close(r.measure("duration").unwrap(), 30.0));

        let valve = a5(0x20, 0x01);
        let data = encode(
            valve,
            &Command::Valve {
                set_point: 21.0,
                room_temperature: 19.5,
            },
        )
        .unwrap();
        assert_eq!(data[2], 0x04);
        assert_eq!(data[3], 0x08);
    }

    #[test]
    fn test_unsupported_encode() {
        assert!(matches!(
            encode(a5(0x02, 0x05), &Command::Switch { on: true }),
            Err(EncodeError::Unsupported { .. })
        ));
        assert!(matches!(
            encode(a5(0x02, 0x0c), &Command::Switch { on: true }),
            Err(EncodeError::UnknownProfile { .. })
        ));
        assert!(!lookup(a5(0x02, 0x05)).unwrap().can_encode());
        assert!(lookup(a5(0x38, 0x08)).unwrap().can_encode());
    }

    #[test]
    fn test_reading_display() {
        let r = decode(eep(Rorg::OneBs, 0x00, 0x01), &[0x09]).unwrap();
        assert_eq!(r.to_string(), "contact=closed");
    }
}
