//! Occupancy of the bus address space.
//!
//! Addresses become occupied when a device confirms them on the bus, with a
//! discovery reply or a status telegram. While a device in learning mode is
//! being assigned an address, the chosen range is held as pending so that no
//! second assignment picks it.

use std::collections::BTreeMap;

use log::{debug, info};
use snafu::{ensure, OptionExt};

use crate::device::Device;
use crate::master::{AddressInUseSnafu, AddressSpaceExhaustedSnafu, Error};
use crate::types::BusAddress;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressState {
    Free,
    /// Reserved for an assignment in progress.
    Pending,
    /// Taken by the device with the given base address.
    Occupied { base: BusAddress },
}

/// Occupancy map and device table of the bus devices.
#[derive(Debug, Default)]
pub struct AddressSpace {
    devices: BTreeMap<BusAddress, Device>,
    pending: BTreeMap<BusAddress, u8>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, address: BusAddress) -> AddressState {
        if covering(&self.pending, address, |size| *size).is_some() {
            return AddressState::Pending;
        }
        match covering(&self.devices, address, |d| d.size) {
            Some((base, _)) => AddressState::Occupied { base },
            None => AddressState::Free,
        }
    }

    fn is_free_run(&self, base: BusAddress, size: u8) -> bool {
        (0..size).all(|n| {
            base.offset(n)
                .map_or(false, |a| self.state(a) == AddressState::Free)
        })
    }

    /// Lowest base address of `size` consecutive free addresses.
    pub fn lowest_free(&self, size: u8) -> Option<BusAddress> {
        let size = size.max(1);
        BusAddress::all().find(|a| self.is_free_run(*a, size))
    }

    /// Reserve `size` addresses for an assignment, at `target` or else at the lowest free run.
    pub fn reserve(&mut self, target: Option<BusAddress>, size: u8) -> Result<BusAddress, Error> {
        let size = size.max(1);
        let base = match target {
            Some(target) => {
                ensure!(
                    self.is_free_run(target, size),
                    AddressInUseSnafu { address: *target }
                );
                target
            }
            None => self
                .lowest_free(size)
                .context(AddressSpaceExhaustedSnafu { size })?,
        };
        debug!("Reserved {} addresses at {}", size, base);
        self.pending.insert(base, size);
        Ok(base)
    }

    /// Give up a reservation.
    pub fn release(&mut self, base: BusAddress) {
        if self.pending.remove(&base).is_some() {
            debug!("Released reservation at {}", base);
        }
    }

    /// Record a device confirmed on the bus, replacing any device it overlaps.
    ///
    /// Returns false if the same device was known already. Radio devices are ignored.
    pub fn confirm(&mut self, device: Device) -> bool {
        let base = match device.address() {
            Some(base) => base,
            None => return false,
        };
        self.pending.remove(&base);
        if self.devices.get(&base) == Some(&device) {
            return false;
        }
        let overlapping: Vec<BusAddress> = device
            .addresses()
            .filter_map(|a| covering(&self.devices, a, |d| d.size).map(|(b, _)| b))
            .collect();
        for old in overlapping {
            if let Some(old) = self.devices.remove(&old) {
                if old.id != device.id {
                    info!("{} replaced by {}", old, device);
                }
            }
        }
        self.devices.insert(base, device);
        true
    }

    /// Record a device seen on the bus (e.g. by its status telegram) unless its address is taken.
    pub fn observe(&mut self, device: Device) -> bool {
        match device.address() {
            Some(base) if self.state(base) == AddressState::Free => self.confirm(device),
            _ => false,
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// The device occupying `address`, which may be one of its channels.
    pub fn device(&self, address: BusAddress) -> Option<&Device> {
        covering(&self.devices, address, |d| d.size).map(|(_, d)| d)
    }

    pub fn free_count(&self) -> usize {
        BusAddress::all()
            .filter(|a| self.state(*a) == AddressState::Free)
            .count()
    }
}

/// The entry whose range `base..base + size` contains `address`.
fn covering<T>(
    map: &BTreeMap<BusAddress, T>,
    address: BusAddress,
    size: impl Fn(&T) -> u8,
) -> Option<(BusAddress, &T)> {
    let (base, entry) = map.range(..=address).next_back()?;
    let end = u16::from(**base) + u16::from(size(entry).max(1));
    (u16::from(*address) < end).then(|| (*base, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::types::addr;

    fn device(base: u8, size: u8) -> Device {
        Device {
            size,
            ..Device::tentative(DeviceId::Bus(addr(base)))
        }
    }

    #[test]
    fn test_empty() {
        let space = AddressSpace::new();
        assert_eq!(space.state(addr(1)), AddressState::Free);
        assert_eq!(space.lowest_free(1), Some(addr(1)));
        assert_eq!(space.lowest_free(127), Some(addr(1)));
        assert_eq!(space.lowest_free(128), None);
        assert_eq!(space.free_count(), 127);
    }

    #[test]
    fn test_confirm_and_channels() {
        let mut space = AddressSpace::new();
        assert!(space.confirm(device(3, 2)));
        assert!(!space.confirm(device(3, 2)));
        assert_eq!(space.state(addr(3)), AddressState::Occupied { base: addr(3) });
        assert_eq!(space.state(addr(4)), AddressState::Occupied { base: addr(3) });
        assert_eq!(space.state(addr(5)), AddressState::Free);
        assert_eq!(space.device(addr(4)).map(|d| d.id), Some(DeviceId::Bus(addr(3))));
        assert_eq!(space.free_count(), 125);
    }

    #[test]
    fn test_lowest_free_skips_holes() {
        let mut space = AddressSpace::new();
        space.confirm(device(1, 1));
        space.confirm(device(3, 1));
        assert_eq!(space.lowest_free(1), Some(addr(2)));
        assert_eq!(space.lowest_free(2), Some(addr(4)));
    }

    #[test]
    fn test_reserve() {
        let mut space = AddressSpace::new();
        space.confirm(device(1, 1));
        let first = space.reserve(None, 1).unwrap();
        assert_eq!(first, addr(2));
        assert_eq!(space.state(addr(2)), AddressState::Pending);
        // never hands out the same address twice
        let second = space.reserve(None, 1).unwrap();
        assert_eq!(second, addr(3));

        assert_eq!(
            space.reserve(Some(addr(1)), 1),
            Err(Error::AddressInUse { address: 1 })
        );
        assert_eq!(
            space.reserve(Some(addr(2)), 1),
            Err(Error::AddressInUse { address: 2 })
        );
        assert_eq!(
            space.reserve(Some(addr(126)), 4),
            Err(Error::AddressInUse { address: 126 })
        );

        space.release(first);
        assert_eq!(space.reserve(None, 1), Ok(addr(2)));
    }

    #[test]
    fn test_exhausted() {
        let mut space = AddressSpace::new();
        space.confirm(device(1, 126));
        assert_eq!(space.reserve(None, 1), Ok(addr(127)));
        assert_eq!(
            space.reserve(None, 1),
            Err(Error::AddressSpaceExhausted { size: 1 })
        );
    }

    #[test]
    fn test_confirm_clears_reservation_and_overlaps() {
        let mut space = AddressSpace::new();
        space.confirm(device(5, 1));
        space.confirm(device(6, 1));
        let base = space.reserve(None, 1).unwrap();
        assert_eq!(base, addr(1));
        space.confirm(device(1, 1));
        assert_eq!(space.state(addr(1)), AddressState::Occupied { base: addr(1) });

        // a 2 channel device now reports at 5
        space.confirm(device(5, 2));
        assert_eq!(space.devices().count(), 2);
        assert_eq!(space.state(addr(6)), AddressState::Occupied { base: addr(5) });
    }

    #[test]
    fn test_observe_keeps_known_devices() {
        let mut space = AddressSpace::new();
        space.confirm(device(3, 2));
        assert!(!space.observe(device(4, 1)));
        assert!(space.observe(device(9, 1)));
        assert_eq!(space.device(addr(4)).map(|d| d.size), Some(2));
    }
}
