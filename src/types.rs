//! This module defines range-checked types for bus addresses and radio ids,
//! meant to simplify correct usage of the API.

use snafu::{ensure, OptionExt, Snafu};

use core::convert::{TryFrom, TryInto};
use core::fmt;
use core::ops::Deref;
use core::str::FromStr;

/// Error type for this module
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The value isn't a valid bus address.
    #[snafu(display("Invalid bus address"))]
    InvalidAddress,
    /// The text isn't a valid radio id.
    #[snafu(display("Invalid radio id {text:?}"))]
    InvalidRadioId { text: String },
    /// The text isn't a valid equipment profile id.
    #[snafu(display("Invalid equipment profile {text:?}"))]
    InvalidProfile { text: String },
}

const fn invalid_address() -> InvalidAddressSnafu {
    InvalidAddressSnafu
}

/// Highest usable bus address.
pub const MAX_ADDRESS: u8 = 127;

/// BusAddress is a range-checked [1, 127] integer, representing a bus participant.
///
/// Address 0 is the identity of a device in address learning mode and is never
/// assigned to a device.
///
/// ## Example
/// ```
/// use eltako_bus::BusAddress;
/// use std::convert::TryInto;
/// let a = BusAddress::new(10).unwrap();
/// let a: BusAddress = 10usize.try_into().unwrap();
/// assert!(BusAddress::new(0).is_err());
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct BusAddress(u8);

/// Create a new [`BusAddress`], panics if it is out of range.
pub const fn addr(a: u8) -> BusAddress {
    if a >= 1 && a <= MAX_ADDRESS {
        return BusAddress(a);
    }
    panic!("Invalid bus address.")
}

impl BusAddress {
    /// Create a new address, checking that the address is in \[1, 127\].
    /// # Errors
    /// Returns [`Error::InvalidAddress`] if `address` is out of range.
    pub fn new(address: impl TryInto<u8>) -> Result<Self, Error> {
        let address = address.try_into().ok().with_context(invalid_address)?;
        ensure!((1..=MAX_ADDRESS).contains(&address), invalid_address());
        Ok(Self(address))
    }

    /// Returns the address `n` places higher, or None if that leaves the address range.
    pub fn offset(self, n: u8) -> Option<Self> {
        self.0
            .checked_add(n)
            .filter(|a| *a <= MAX_ADDRESS)
            .map(Self)
    }

    /// Returns the next higher address, or None if the current value is at max.
    pub fn next(self) -> Option<Self> {
        self.offset(1)
    }

    /// The radio id a bus device uses as sender of its wrapped status telegrams.
    pub const fn radio_id(self) -> RadioId {
        RadioId(self.0 as u32)
    }

    /// All usable bus addresses in ascending order.
    pub fn all() -> impl Iterator<Item = BusAddress> {
        (1..=MAX_ADDRESS).map(Self)
    }
}

impl Deref for BusAddress {
    type Target = u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq<usize> for BusAddress {
    fn eq(&self, other: &usize) -> bool {
        self.0 as usize == *other
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trait to convert `T: TryInto<u8>` into a [`BusAddress`].
pub trait IntoBusAddress {
    /// Convert self to a BusAddress.
    /// # Errors
    /// Returns `Error:InvalidAddress` if self isn't a valid address.
    fn into_bus_address(self) -> Result<BusAddress, Error>;
}

impl IntoBusAddress for BusAddress {
    fn into_bus_address(self) -> Result<BusAddress, Error> {
        Ok(self)
    }
}

impl<T> IntoBusAddress for T
where
    T: TryInto<u8>,
{
    fn into_bus_address(self) -> Result<BusAddress, Error> {
        BusAddress::new(self)
    }
}

impl TryFrom<usize> for BusAddress {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}


/// RadioId is the 32-bit sender id of a radio telegram.
///
/// Bus devices send their wrapped status telegrams with the id `00-00-00-aa`,
/// `aa` being their bus address. Displayed as dash separated hex bytes.
///
/// ## Example
/// ```
/// use eltako_bus::RadioId;
/// let id: RadioId = "FF-DD-CC-BB".parse().unwrap();
/// assert_eq!(id.to_bytes(), [0xff, 0xdd, 0xcc, 0xbb]);
/// assert_eq!(id.to_string(), "FF-DD-CC-BB");
/// ```
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
#[repr(transparent)]
pub struct RadioId(u32);

impl RadioId {
    /// Create a radio id from its numeric value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Create a radio id from its big endian wire bytes.
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    /// The big endian wire bytes.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// The bus address, if this is the id under which a bus device reports its status.
    pub fn bus_address(self) -> Option<BusAddress> {
        match self.to_bytes() {
            [0, 0, 0, a] => BusAddress::new(a).ok(),
            _ => None,
        }
    }

    /// The id `n` places above this one, used for the consecutive ids of a gateway's base id range.
    pub fn offset(self, n: u32) -> Option<Self> {
        self.0.checked_add(n).map(Self)
    }
}

impl Deref for RadioId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RadioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.to_bytes();
        write!(f, "{:02X}-{:02X}-{:02X}-{:02X}", a, b, c, d)
    }
}

impl FromStr for RadioId {
    type Err = Error;

    /// Accepts `FF-DD-CC-BB`, `ff:dd:cc:bb` and `ffddccbb`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| !matches!(c, '-' | ':' | ' ')).collect();
        let invalid = || InvalidRadioIdSnafu { text: s }.build();
        if hex.len() != 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        u32::from_str_radix(&hex, 16)
            .map(Self)
            .map_err(|_| invalid())
    }
}

impl From<[u8; 4]> for RadioId {
    fn from(bytes: [u8; 4]) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod radio_id_tests {
    use super::{addr, RadioId};

    #[test]
    fn test_radio_id_text() {
        let id: RadioId = "FF-DD-CC-BB".parse().unwrap();
        assert_eq!(*id, 0xffdd_ccbb);
        assert_eq!(id.to_string(), "FF-DD-CC-BB");
        assert_eq!("ff:dd:cc:bb".parse::<RadioId>().unwrap(), id);
        assert_eq!("ffddccbb".parse::<RadioId>().unwrap(), id);
        assert!("FF-DD-CC".parse::<RadioId>().is_err());
        assert!("GG-DD-CC-BB".parse::<RadioId>().is_err());
        assert!("+fddccbb".parse::<RadioId>().is_err());
        assert!("+F-DD-CC-BB".parse::<RadioId>().is_err());
    }

    #[test]
    fn test_bus_address() {
        assert_eq!(RadioId::from_bytes([0, 0, 0, 5]).bus_address(), Some(addr(5)));
        assert_eq!(addr(5).radio_id(), RadioId::from_bytes([0, 0, 0, 5]));
        assert_eq!(RadioId::from_bytes([0, 0, 0, 0]).bus_address(), None);
        assert_eq!(RadioId::from_bytes([0, 0, 0, 0x80]).bus_address(), None);
        assert_eq!(RadioId::from_bytes([0xff, 0, 0, 5]).bus_address(), None);
    }
}
