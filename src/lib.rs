//! Bus master for the Eltako RS485 bus.
//!
//! The Eltako bus carries EnOcean Serial Protocol 2 (ESP2) telegrams between the
//! devices on a DIN rail, and extends ESP2 with control telegrams for bus address
//! enumeration, device discovery and memory access. This crate lets a host take
//! part on that bus without the vendor's bus master software:
//!
//! * [`codec`] frames, checksums and resynchronizes the byte stream into [`Telegram`]s.
//! * [`eep`] is the equipment profile registry decoding payloads into physical values.
//! * [`address`] tracks which of the 127 bus addresses are in use.
//! * [`memory`] holds the row-based memory access rules and the single-owner unlock session.
//! * [`cache`] keeps discovery replies and memory rows while the bus is locked.
//! * [`programming`] writes the rows that make actuators obey the host.
//! * [`transport`] runs the serial connection on a worker thread and reconnects on failure.
//! * [`Master`] ties them together into the command surface used by applications.
//!
//! # Example
//!
//! ```no_run
//! use eltako_bus::{addr, Master, MasterConfig, SerialConnector, Transport, TransportConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = SerialConnector::new("/dev/ttyUSB0", eltako_bus::transport::DEFAULT_BAUD_RATE);
//! let transport = Transport::start(connector, TransportConfig::default())?;
//! let master = Master::new(transport, MasterConfig::default());
//!
//! for step in master.scan_range(addr(1), addr(127)) {
//!     if let Ok(device) = step.outcome {
//!         println!("{}", device);
//!     }
//! }
//! # Ok(()) }
//! ```

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod buffer;
mod nom_parser;

pub mod address;
pub mod cache;
pub mod codec;
pub mod device;
pub mod eep;
pub mod master;
pub mod memory;
pub mod programming;
pub mod telegram;
pub mod transport;
pub mod types;

pub use crate::address::{AddressSpace, AddressState};
pub use crate::cache::BusCache;
pub use crate::codec::{Decoded, Decoder, MalformedFrame, MalformedReason};
pub use crate::device::{Device, DeviceId, DeviceType};
pub use crate::eep::{Command, Eep, EquipmentProfile, Reading, Value};
pub use crate::master::Error;
pub use crate::master::{CancelToken, Master, MasterConfig, Scan, ScanStep};
pub use crate::memory::MemorySession;
pub use crate::programming::{DirectCommand, KeyFunction, RockerSide, Source};
pub use crate::telegram::{DiscoveryReply, RadioTelegram, RowData, Telegram};
pub use crate::transport::{
    ConnectionState, Connector, Diagnostic, Event, SerialConnector, Transport, TransportConfig,
};
pub use crate::types::{addr, BusAddress, RadioId};

/// ESP2 checksum: the sum of all bytes between sync and checksum, modulo 256.
pub(crate) fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Formats bytes as space separated hex pairs, for logs and error messages.
#[derive(Copy, Clone)]
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
