//! Typed telegrams of the Eltako bus.
//!
//! Every telegram is 11 bytes between the `A5 5A` sync and the checksum. The
//! first byte carries the h_seq (telegram class) in its upper three bits and the
//! length (always 11) in the lower five, the second is the ORG. Radio telegrams
//! continue with 4 data bytes, a 4 byte sender id and a status byte; bus control
//! telegrams continue with 8 payload bytes and an address byte.

use core::fmt;

use crate::codec::MalformedReason;
use crate::eep::{Eep, Rorg};
use crate::types::{BusAddress, RadioId};
use crate::Hex;

/// Length of a complete frame on the wire.
pub const FRAME_LEN: usize = 14;
/// Length of the checksummed part between sync and checksum.
pub const BODY_LEN: usize = 11;
/// Sync bytes starting every frame.
pub const SYNC: [u8; 2] = [0xa5, 0x5a];
/// Size of a device memory row.
pub const ROW_SIZE: usize = 8;

/// Content of one device memory row.
pub type RowData = [u8; ROW_SIZE];

/// The checksummed part of a frame.
pub type Body = [u8; BODY_LEN];

const LENGTH: u8 = 0x0b;

/// Telegram class, the upper three bits of the header byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderSeq {
    /// Radio telegram received
    Rrt = 0,
    /// Radio telegram to transmit
    Trt = 3,
    /// Bus message received
    Rmt = 4,
    /// Bus command transmitted
    Tct = 5,
}

impl HeaderSeq {
    fn from_header(header: u8) -> Option<Self> {
        match header >> 5 {
            0 => Some(Self::Rrt),
            3 => Some(Self::Trt),
            4 => Some(Self::Rmt),
            5 => Some(Self::Tct),
            _ => None,
        }
    }

    const fn header(self) -> u8 {
        ((self as u8) << 5) | LENGTH
    }
}

/// ORG byte values.
pub mod org {
    /// Repeated switch communication, 1 data byte
    pub const RPS: u8 = 0x05;
    /// 1 byte communication
    pub const ONE_BS: u8 = 0x06;
    /// 4 byte communication
    pub const FOUR_BS: u8 = 0x07;
    pub const DISCOVERY: u8 = 0xf0;
    pub const MEMORY: u8 = 0xf1;
    pub const SELECT: u8 = 0xf2;
    pub const WRITE: u8 = 0xf4;
    /// Address assignment on TCT, timeout on RMT.
    pub const ASSIGN: u8 = 0xf8;
    pub const POLL: u8 = 0xfc;
    pub const IDENTIFY: u8 = 0xfd;
    pub const POLL_FORCED: u8 = 0xfe;
    /// Bus lock (address FF) and unlock (address 00).
    pub const LOCK: u8 = 0xff;
}

const LOCK_ADDRESS: u8 = 0xff;
const UNLOCK_ADDRESS: u8 = 0x00;
const ZERO_PAYLOAD: [u8; 8] = [0; 8];

/// A radio telegram: ORG, 4 data bytes in wire order (DB3 first for 4BS,
/// DB0 first for RPS and 1BS), sender id and status byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RadioTelegram {
    pub org: u8,
    pub data: [u8; 4],
    pub sender: RadioId,
    pub status: u8,
}

impl RadioTelegram {
    /// A repeated switch telegram carrying `db0`.
    pub const fn rps(sender: RadioId, db0: u8, status: u8) -> Self {
        Self {
            org: org::RPS,
            data: [db0, 0, 0, 0],
            sender,
            status,
        }
    }

    /// A 1 byte telegram carrying `db0`.
    pub const fn one_bs(sender: RadioId, db0: u8, status: u8) -> Self {
        Self {
            org: org::ONE_BS,
            data: [db0, 0, 0, 0],
            sender,
            status,
        }
    }

    /// A 4 byte telegram carrying `[DB3, DB2, DB1, DB0]`.
    pub const fn four_bs(sender: RadioId, data: [u8; 4], status: u8) -> Self {
        Self {
            org: org::FOUR_BS,
            data,
            sender,
            status,
        }
    }

    /// The payload bytes that carry information for this ORG.
    pub fn payload(&self) -> &[u8] {
        match self.org {
            org::RPS | org::ONE_BS => &self.data[..1],
            _ => &self.data,
        }
    }

    /// Whether the learn bit marks this as a teach-in telegram.
    pub fn is_teach_in(&self) -> bool {
        match self.org {
            org::FOUR_BS => self.data[3] & 0x08 == 0,
            org::ONE_BS => self.data[0] & 0x08 == 0,
            _ => false,
        }
    }

    /// The profile announced by a variation 2 4BS teach-in telegram.
    pub fn teach_in(&self) -> Option<TeachIn> {
        if self.org != org::FOUR_BS || self.data[3] & 0xf8 != 0x80 {
            return None;
        }
        let [db3, db2, db1, _] = self.data;
        Some(TeachIn {
            profile: Eep::new(
                Rorg::FourBs,
                db3 >> 2,
                ((db3 & 0x03) << 5) | (db2 >> 3),
            ),
            manufacturer: (u16::from(db2 & 0x07) << 8) | u16::from(db1),
        })
    }

    /// Number of the RPS rocker the telegram was sent by, 1 or 2 (status bit T21).
    pub fn t21(&self) -> u8 {
        if self.status & 0x20 != 0 {
            2
        } else {
            1
        }
    }

    /// RPS N-message (status bit NU), as opposed to an U-message.
    pub fn is_n_message(&self) -> bool {
        self.status & 0x10 != 0
    }

    /// Repeater count from the status byte.
    pub fn repeat_count(&self) -> u8 {
        self.status & 0x0f
    }

    fn write_body(&self, seq: HeaderSeq, body: &mut Body) {
        body[0] = seq.header();
        body[1] = self.org;
        body[2..6].copy_from_slice(&self.data);
        body[6..10].copy_from_slice(&self.sender.to_bytes());
        body[10] = self.status;
    }

    fn from_body(body: &Body) -> Self {
        Self {
            org: body[1],
            data: [body[2], body[3], body[4], body[5]],
            sender: RadioId::from_bytes([body[6], body[7], body[8], body[9]]),
            status: body[10],
        }
    }
}

/// Profile and manufacturer announced by a 4BS teach-in telegram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TeachIn {
    pub profile: Eep,
    pub manufacturer: u16,
}

/// Flags byte of a discovery reply sent by the bus gateway (FAM).
pub const FAM_FLAGS: u8 = 0x00;
/// Flags byte of a discovery reply sent by any other bus device.
pub const DEVICE_FLAGS: u8 = 0x08;

/// Summary a bus device reports about itself when discovered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryReply {
    /// Bus address of the device, 0 while it is in address learning mode.
    pub address: u8,
    /// Number of consecutive bus addresses the device occupies.
    pub size: u8,
    /// Number of memory rows.
    pub memory_size: u8,
    /// Raw flags byte, see [`FAM_FLAGS`] and [`DEVICE_FLAGS`].
    pub flags: u8,
    /// Model bytes; the first two identify the model, the last two its firmware version.
    pub model: [u8; 4],
}

impl DiscoveryReply {
    pub fn is_fam(&self) -> bool {
        self.flags == FAM_FLAGS
    }

    fn payload(&self) -> [u8; 8] {
        let [m0, m1, m2, m3] = self.model;
        [
            self.address,
            self.size,
            self.memory_size,
            self.flags,
            m0,
            m1,
            m2,
            m3,
        ]
    }

    fn from_payload(p: [u8; 8]) -> Self {
        Self {
            address: p[0],
            size: p[1],
            memory_size: p[2],
            flags: p[3],
            model: [p[4], p[5], p[6], p[7]],
        }
    }
}

/// Bus control telegram of an ORG without a dedicated [`Telegram`] variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ControlTelegram {
    /// TCT (sent by the bus master) rather than RMT.
    pub request: bool,
    pub org: u8,
    pub payload: [u8; 8],
    pub address: u8,
}

/// A telegram on the Eltako bus.
///
/// Addresses inside bus control telegrams are kept as raw bytes, since the wire
/// allows the full byte range; the [`Master`](crate::Master) only sends valid
/// [`BusAddress`]es.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Telegram {
    /// Radio telegram received by the gateway (RRT).
    RadioReceived(RadioTelegram),
    /// Radio telegram to be sent by the gateway (TRT).
    RadioTransmit(RadioTelegram),
    /// Status of a bus device, wrapped like a radio telegram (RMT with a radio ORG).
    /// The status byte travels in the address byte.
    BusStatus(RadioTelegram),
    /// Lock the bus; the FAM stops polling.
    Lock,
    /// Unlock the bus.
    Unlock,
    /// Ask the device at an address, or any device in learning mode, to describe itself.
    DiscoveryRequest(u8),
    DiscoveryReply(DiscoveryReply),
    /// Assign a bus address to the device in learning mode.
    AssignAddress(u8),
    /// Sent by the FAM when a polled device didn't answer.
    Timeout,
    MemoryRequest { address: u8, row: u8 },
    MemoryResponse { row: u8, value: RowData },
    /// Select a device for the following row writes.
    SelectDevice(u8),
    /// Write a row of the selected device.
    WriteRow { row: u8, value: RowData },
    /// Ask a device to send queued telegrams.
    Poll(u8),
    /// Ask a device to send its status, queued or not.
    PollForced(u8),
    /// Make a device blink its LED.
    Identify(u8),
    Control(ControlTelegram),
}

/// Coarse classification of telegrams.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    /// RPS or 1BS radio telegram, one data byte.
    ShortRadio,
    /// 4BS (or other) radio telegram, four data bytes.
    LongRadio,
    /// Radio-style status telegram of a bus device.
    BusStatus,
    /// Bus control telegram.
    Control,
}

/// Who sent a telegram, as far as the telegram itself tells.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Sender {
    Bus(BusAddress),
    Radio(RadioId),
}

impl Telegram {
    pub fn kind(&self) -> Kind {
        match self {
            Self::RadioReceived(r) | Self::RadioTransmit(r) => match r.org {
                org::RPS | org::ONE_BS => Kind::ShortRadio,
                _ => Kind::LongRadio,
            },
            Self::BusStatus(_) => Kind::BusStatus,
            _ => Kind::Control,
        }
    }

    /// The sender, for radio telegrams, bus status telegrams and discovery replies.
    pub fn sender(&self) -> Option<Sender> {
        match self {
            Self::RadioReceived(r) | Self::RadioTransmit(r) => Some(Sender::Radio(r.sender)),
            Self::BusStatus(r) => Some(
                r.sender
                    .bus_address()
                    .map_or(Sender::Radio(r.sender), Sender::Bus),
            ),
            Self::DiscoveryReply(reply) => BusAddress::new(reply.address).ok().map(Sender::Bus),
            _ => None,
        }
    }

    /// The radio part of radio and bus status telegrams.
    pub fn radio(&self) -> Option<&RadioTelegram> {
        match self {
            Self::RadioReceived(r) | Self::RadioTransmit(r) | Self::BusStatus(r) => Some(r),
            _ => None,
        }
    }

    /// The bus address a request is directed at, 0 for requests to the learning identity.
    pub fn target(&self) -> Option<u8> {
        match *self {
            Self::DiscoveryRequest(a)
            | Self::AssignAddress(a)
            | Self::SelectDevice(a)
            | Self::Poll(a)
            | Self::PollForced(a)
            | Self::Identify(a)
            | Self::MemoryRequest { address: a, .. } => Some(a),
            Self::Control(c) if c.request => Some(c.address),
            _ => None,
        }
    }

    pub fn header_seq(&self) -> HeaderSeq {
        match self {
            Self::RadioReceived(_) => HeaderSeq::Rrt,
            Self::RadioTransmit(_) => HeaderSeq::Trt,
            Self::BusStatus(_)
            | Self::DiscoveryReply(_)
            | Self::Timeout
            | Self::MemoryResponse { .. } => HeaderSeq::Rmt,
            Self::Control(c) if !c.request => HeaderSeq::Rmt,
            _ => HeaderSeq::Tct,
        }
    }

    /// The checksummed bytes of this telegram.
    pub fn to_body(&self) -> Body {
        let mut body = [0u8; BODY_LEN];
        match *self {
            Self::RadioReceived(r) => r.write_body(HeaderSeq::Rrt, &mut body),
            Self::RadioTransmit(r) => r.write_body(HeaderSeq::Trt, &mut body),
            Self::BusStatus(r) => r.write_body(HeaderSeq::Rmt, &mut body),
            _ => {
                let (org, payload, address) = self.control_parts();
                body[0] = self.header_seq().header();
                body[1] = org;
                body[2..10].copy_from_slice(&payload);
                body[10] = address;
            }
        }
        body
    }

    fn control_parts(&self) -> (u8, [u8; 8], u8) {
        match *self {
            Self::Lock => (org::LOCK, ZERO_PAYLOAD, LOCK_ADDRESS),
            Self::Unlock => (org::LOCK, ZERO_PAYLOAD, UNLOCK_ADDRESS),
            Self::DiscoveryRequest(a) => (org::DISCOVERY, ZERO_PAYLOAD, a),
            Self::DiscoveryReply(reply) => (org::DISCOVERY, reply.payload(), 0),
            Self::AssignAddress(a) => (org::ASSIGN, ZERO_PAYLOAD, a),
            Self::Timeout => (org::ASSIGN, ZERO_PAYLOAD, 0),
            Self::MemoryRequest { address, row } => {
                let mut payload = ZERO_PAYLOAD;
                payload[7] = row;
                (org::MEMORY, payload, address)
            }
            Self::MemoryResponse { row, value } => (org::MEMORY, value, row),
            Self::SelectDevice(a) => (org::SELECT, ZERO_PAYLOAD, a),
            Self::WriteRow { row, value } => (org::WRITE, value, row),
            Self::Poll(a) => (org::POLL, ZERO_PAYLOAD, a),
            Self::PollForced(a) => (org::POLL_FORCED, ZERO_PAYLOAD, a),
            Self::Identify(a) => (org::IDENTIFY, ZERO_PAYLOAD, a),
            Self::Control(c) => (c.org, c.payload, c.address),
            Self::RadioReceived(r) | Self::RadioTransmit(r) | Self::BusStatus(r) => {
                let mut payload = ZERO_PAYLOAD;
                payload[..4].copy_from_slice(&r.data);
                payload[4..].copy_from_slice(&r.sender.to_bytes());
                (r.org, payload, r.status)
            }
        }
    }

    /// Interpret the checksummed bytes of a frame.
    ///
    /// Fails only if the header byte doesn't describe an 11 byte telegram of a
    /// known class; every ORG has a representation.
    pub fn from_body(body: &Body) -> Result<Telegram, MalformedReason> {
        if body[0] & 0x1f != LENGTH {
            return Err(MalformedReason::Length);
        }
        let seq = HeaderSeq::from_header(body[0]).ok_or(MalformedReason::Header)?;
        let org_code = body[1];
        let mut payload = ZERO_PAYLOAD;
        payload.copy_from_slice(&body[2..10]);
        let address = body[10];
        let zero = payload == ZERO_PAYLOAD;

        let telegram = match seq {
            HeaderSeq::Rrt => Self::RadioReceived(RadioTelegram::from_body(body)),
            HeaderSeq::Trt => Self::RadioTransmit(RadioTelegram::from_body(body)),
            HeaderSeq::Rmt => match org_code {
                org::RPS | org::ONE_BS | org::FOUR_BS => {
                    Self::BusStatus(RadioTelegram::from_body(body))
                }
                org::DISCOVERY if address == 0 && matches!(payload[3], FAM_FLAGS | DEVICE_FLAGS) => {
                    Self::DiscoveryReply(DiscoveryReply::from_payload(payload))
                }
                org::MEMORY => Self::MemoryResponse {
                    row: address,
                    value: payload,
                },
                org::ASSIGN if zero && address == 0 => Self::Timeout,
                _ => Self::control(false, org_code, payload, address),
            },
            HeaderSeq::Tct => match org_code {
                org::LOCK if zero && address == LOCK_ADDRESS => Self::Lock,
                org::LOCK if zero && address == UNLOCK_ADDRESS => Self::Unlock,
                org::DISCOVERY if zero => Self::DiscoveryRequest(address),
                org::ASSIGN if zero => Self::AssignAddress(address),
                org::MEMORY if payload[..7] == ZERO_PAYLOAD[..7] => Self::MemoryRequest {
                    address,
                    row: payload[7],
                },
                org::SELECT if zero => Self::SelectDevice(address),
                org::WRITE => Self::WriteRow {
                    row: address,
                    value: payload,
                },
                org::POLL if zero => Self::Poll(address),
                org::POLL_FORCED if zero => Self::PollForced(address),
                org::IDENTIFY if zero => Self::Identify(address),
                _ => Self::control(true, org_code, payload, address),
            },
        };
        Ok(telegram)
    }

    const fn control(request: bool, org: u8, payload: [u8; 8], address: u8) -> Self {
        Self::Control(ControlTelegram {
            request,
            org,
            payload,
            address,
        })
    }
}

impl fmt::Display for RadioTelegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "org {:02x} from {} data {} status {:02x}",
            self.org,
            self.sender,
            Hex(self.payload()),
            self.status
        )
    }
}

impl fmt::Display for Telegram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RadioReceived(r) => write!(f, "Radio received, {}", r),
            Self::RadioTransmit(r) => write!(f, "Radio transmit, {}", r),
            Self::BusStatus(r) => write!(f, "Bus status, {}", r),
            Self::Lock => f.write_str("Bus lock"),
            Self::Unlock => f.write_str("Bus unlock"),
            Self::DiscoveryRequest(a) => write!(f, "Discovery request to {}", a),
            Self::DiscoveryReply(r) => write!(
                f,
                "Discovery reply address {} size {} memory {} model {}{}",
                r.address,
                r.size,
                r.memory_size,
                Hex(&r.model),
                if r.is_fam() { " (FAM)" } else { "" }
            ),
            Self::AssignAddress(a) => write!(f, "Assign address {}", a),
            Self::Timeout => f.write_str("Timeout"),
            Self::MemoryRequest { address, row } => {
                write!(f, "Memory request to {} row {}", address, row)
            }
            Self::MemoryResponse { row, value } => {
                write!(f, "Memory response row {} value {}", row, Hex(value))
            }
            Self::SelectDevice(a) => write!(f, "Select device {}", a),
            Self::WriteRow { row, value } => write!(f, "Write row {} value {}", row, Hex(value)),
            Self::Poll(a) => write!(f, "Poll {}", a),
            Self::PollForced(a) => write!(f, "Forced poll {}", a),
            Self::Identify(a) => write!(f, "Identify {}", a),
            Self::Control(c) => write!(
                f,
                "{} org {:02x} address {:02x} payload {}",
                if c.request { "Request" } else { "Response" },
                c.org,
                c.address,
                Hex(&c.payload)
            ),
        }
    }
}
