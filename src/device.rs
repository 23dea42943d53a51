//! Bus participants and radio senders.
//!
//! Bus devices identify themselves in their discovery reply with two model bytes
//! and the number of bus addresses they occupy. [`DeviceType::from_model`] maps
//! those to the known Eltako series 14 models; everything else is kept as
//! [`DeviceType::Unknown`] with its model bytes.

use core::fmt;

use crate::eep::{eep, Eep, Rorg};
use crate::telegram::DiscoveryReply;
use crate::types::{BusAddress, RadioId};
use crate::Hex;

/// Identity of a device: its base bus address, or the id radio telegrams carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Bus(BusAddress),
    Radio(RadioId),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(a) => write!(f, "bus {}", a),
            Self::Radio(id) => write!(f, "radio {}", id),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Bus gateway and bus master
    Fam14,
    Fud14,
    Fud14W800,
    Fsb14,
    Fsr14x1,
    Fsr14x2,
    Fsr14x4,
    Fsr14Mx2,
    F4sr14Led,
    F3z14d,
    Fmz14,
    Fwg14ms,
    Fsu14,
    Fmsr14,
    Fwz14A65,
    Fsg14V10,
    Fgw14Usb,
    Fdg14,
    Fd2g14,
    Fhk14,
    F4hk14,
    Fae14ssr,
    Ftd14,
    Unknown([u8; 2]),
}

use DeviceType::*;

/// Model bytes, reported size and type of the known models.
const MODELS: &[([u8; 2], u8, DeviceType)] = &[
    ([0x07, 0xff], 1, Fam14),
    ([0x08, 0xff], 1, Fam14),
    ([0x04, 0x04], 1, Fud14),
    ([0x04, 0x05], 1, Fud14W800),
    ([0x04, 0x06], 2, Fsb14),
    ([0x04, 0x01], 1, Fsr14x1),
    ([0x04, 0x02], 2, Fsr14x2),
    ([0x04, 0x01], 4, Fsr14x4),
    ([0x04, 0x0b], 2, Fsr14Mx2),
    ([0x04, 0x09], 4, F4sr14Led),
    ([0x04, 0x67], 3, F3z14d),
    ([0x04, 0x0e], 1, Fmz14),
    ([0x04, 0x1a], 1, Fwg14ms),
    ([0x07, 0x14], 8, Fsu14),
    ([0x05, 0x15], 5, Fmsr14),
    ([0x04, 0x66], 1, Fwz14A65),
    ([0x04, 0x07], 1, Fsg14V10),
    ([0x04, 0xfe], 1, Fgw14Usb),
    ([0x04, 0x34], 16, Fdg14),
    ([0x04, 0x82], 16, Fd2g14),
    ([0x04, 0x18], 2, Fhk14),
    ([0x04, 0x18], 4, F4hk14),
    ([0x04, 0x16], 2, Fae14ssr),
    ([0x04, 0xa0], 1, Ftd14),
];

impl DeviceType {
    /// Identify a model. Some model bytes are shared by variants that differ only
    /// in the number of channels, so both the model bytes and the size must match.
    pub fn from_model(model: [u8; 2], size: u8) -> Self {
        MODELS
            .iter()
            .find(|(m, s, _)| *m == model && *s == size)
            .map_or(Unknown(model), |(_, _, t)| *t)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Fam14 => "FAM14",
            Fud14 => "FUD14",
            Fud14W800 => "FUD14-800W",
            Fsb14 => "FSB14",
            Fsr14x1 => "FSR14-1x",
            Fsr14x2 => "FSR14-2x",
            Fsr14x4 => "FSR14-4x",
            Fsr14Mx2 => "FSR14M-2x",
            F4sr14Led => "F4SR14-LED",
            F3z14d => "F3Z14D",
            Fmz14 => "FMZ14",
            Fwg14ms => "FWG14MS",
            Fsu14 => "FSU14",
            Fmsr14 => "FMSR14",
            Fwz14A65 => "FWZ14-65A",
            Fsg14V10 => "FSG14-1-10V",
            Fgw14Usb => "FGW14-USB",
            Fdg14 => "FDG14",
            Fd2g14 => "FD2G14",
            Fhk14 => "FHK14",
            F4hk14 => "F4HK14",
            Fae14ssr => "FAE14SSR",
            Ftd14 => "FTD14",
            Unknown(_) => "unknown",
        }
    }

    /// Profile of the status telegrams the device sends on the bus.
    pub fn status_profile(&self) -> Option<Eep> {
        match self {
            Fud14 | Fud14W800 | Fsg14V10 | Fdg14 | Fd2g14 => Some(eep(Rorg::FourBs, 0x38, 0x08)),
            Fsr14x1 | Fsr14x2 | Fsr14x4 | Fsr14Mx2 | F4sr14Led | Fmz14 | Fhk14 | F4hk14
            | Fae14ssr => Some(eep(Rorg::SwitchStatus, 0x38, 0x08)),
            Fsb14 => Some(eep(Rorg::ShutterStatus, 0x3f, 0x7f)),
            Fwz14A65 => Some(eep(Rorg::FourBs, 0x12, 0x01)),
            _ => None,
        }
    }

    /// Gateways hold the radio base id in memory row 1.
    pub fn is_gateway(&self) -> bool {
        matches!(self, Fam14 | Fgw14Usb | Ftd14)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unknown(model) => write!(f, "unknown ({})", Hex(model)),
            known => f.write_str(known.name()),
        }
    }
}

/// Firmware version from the last two model bytes, one nibble per part.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub [u8; 4]);

impl Version {
    fn from_model(model: [u8; 4]) -> Self {
        let [_, _, high, low] = model;
        Self([high >> 4, high & 0x0f, low >> 4, low & 0x0f])
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// A device the master knows of.
///
/// Devices are created tentatively the first time they are referenced, and
/// filled in once a discovery reply or a teach-in telegram tells more.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub device_type: DeviceType,
    /// Profile of the telegrams the device sends.
    pub profile: Option<Eep>,
    /// Number of memory rows.
    pub memory_size: u8,
    /// Number of consecutive bus addresses, one per channel.
    pub size: u8,
    pub version: Option<Version>,
}

impl Device {
    /// A bus device as described by its discovery reply.
    pub fn from_discovery(address: BusAddress, reply: &DiscoveryReply) -> Self {
        let [m0, m1, _, _] = reply.model;
        let size = reply.size.max(1);
        let device_type = DeviceType::from_model([m0, m1], size);
        Self {
            id: DeviceId::Bus(address),
            device_type,
            profile: device_type.status_profile(),
            memory_size: reply.memory_size,
            size,
            version: Some(Version::from_model(reply.model)),
        }
    }

    /// A device nothing is known about yet.
    pub fn tentative(id: DeviceId) -> Self {
        Self {
            id,
            device_type: Unknown([0, 0]),
            profile: None,
            memory_size: 0,
            size: 1,
            version: None,
        }
    }

    /// A radio sender, optionally with its profile.
    pub fn radio(id: RadioId, profile: Option<Eep>) -> Self {
        Self {
            profile,
            ..Self::tentative(DeviceId::Radio(id))
        }
    }

    /// Base bus address, for bus devices.
    pub fn address(&self) -> Option<BusAddress> {
        match self.id {
            DeviceId::Bus(a) => Some(a),
            DeviceId::Radio(_) => None,
        }
    }

    /// True once the type or the profile is resolved.
    pub fn is_known(&self) -> bool {
        !matches!(self.device_type, Unknown(_)) || self.profile.is_some()
    }

    /// All bus addresses the device occupies.
    pub fn addresses(&self) -> impl Iterator<Item = BusAddress> {
        let base = self.address();
        (0..self.size).filter_map(move |n| base.and_then(|b| b.offset(n)))
    }

    /// Channel number (starting at 1) of the given bus address, if it belongs to the device.
    pub fn channel(&self, address: BusAddress) -> Option<u8> {
        let base = self.address()?;
        let n = address.checked_sub(*base)?;
        (n < self.size).then(|| n + 1)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.device_type, self.id)?;
        if self.size > 1 {
            write!(f, " size {}", self.size)?;
        }
        if let Some(profile) = self.profile {
            write!(f, " profile {}", profile)?;
        }
        if let Some(version) = self.version {
            write!(f, " version {}", version)?;
        }
        Ok(())
    }
}
