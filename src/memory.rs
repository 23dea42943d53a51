//! Device memory access.
//!
//! Bus devices keep their configuration in rows of 8 bytes. Rows are read with a
//! memory request to the device, and written by selecting the device and then
//! writing rows to it. Every write is read back and compared.
//!
//! Memory access needs the FAM to stop polling, so rows are only reachable
//! through a [`MemorySession`], of which there is at most one on the bus at a
//! time. Opening a session locks the bus, closing it unlocks the bus again.
//! While the bus is locked, rows already read come from the bus cache of the
//! [`Master`] unless the device was selected for writing since.
//!
//! ## Example
//! ```no_run
//! # fn f(master: &eltako_bus::Master, device: &eltako_bus::Device) -> Result<(), eltako_bus::Error> {
//! let session = master.unlock_memory(device)?;
//! let mut row = session.read_row(12)?;
//! row[7] = 0x01;
//! session.write_row(12, row)?;
//! session.lock()?;
//! # Ok(()) }
//! ```

use std::convert::TryFrom;
use std::ops::Range;
use std::sync::{Condvar, Mutex, PoisonError};

use log::{debug, info, warn};
use snafu::{ensure, OptionExt};

use crate::device::Device;
use crate::lock;
use crate::master::{BusySnafu, Error, Master, NotOnBusSnafu, OutOfRangeSnafu, VerificationFailedSnafu};
use crate::programming::KeyFunction;
use crate::telegram::{org, RowData, Telegram};
use crate::types::{BusAddress, RadioId};

/// Check a row index against the memory size of a device.
///
/// # Errors
/// [`Error::OutOfRange`] unless `0 <= row < memory_size`.
pub fn check_row(row: i64, memory_size: u8) -> Result<u8, Error> {
    let checked = u8::try_from(row).ok().filter(|r| *r < memory_size);
    checked.context(OutOfRangeSnafu { row, memory_size })
}

/// Bus-wide ownership of memory access.
#[derive(Debug, Default)]
pub(crate) struct MemoryLock {
    owner: Mutex<Option<BusAddress>>,
    released: Condvar,
}

impl MemoryLock {
    /// Wait until memory access is free and take it.
    pub(crate) fn acquire(&self, address: BusAddress) {
        let mut owner = lock(&self.owner);
        while let Some(current) = *owner {
            debug!("Memory access held for {}, waiting", current);
            owner = self
                .released
                .wait(owner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *owner = Some(address);
    }

    pub(crate) fn try_acquire(&self, address: BusAddress) -> Result<(), Error> {
        let mut owner = lock(&self.owner);
        ensure!(owner.is_none(), BusySnafu);
        *owner = Some(address);
        Ok(())
    }

    pub(crate) fn release(&self) {
        lock(&self.owner).take();
        self.released.notify_one();
    }
}

/// Exclusive memory access to one device.
///
/// Dropping the session ends it like [`lock`](Self::lock) does, logging a
/// failure to unlock the bus instead of returning it.
pub struct MemorySession<'a> {
    master: &'a Master,
    device: Device,
    address: BusAddress,
    open: bool,
}

impl<'a> MemorySession<'a> {
    pub(crate) fn open(master: &'a Master, device: &Device, wait: bool) -> Result<Self, Error> {
        let address = device
            .address()
            .context(NotOnBusSnafu { device: device.id })?;
        if wait {
            master.memory_lock().acquire(address);
        } else {
            master.memory_lock().try_acquire(address)?;
        }
        // from here on, Drop gives up the ownership again
        let session = Self {
            master,
            device: device.clone(),
            address,
            open: true,
        };
        master.lock_bus()?;
        info!("Memory of {} unlocked", session.device);
        Ok(session)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Base bus address of the device.
    pub fn address(&self) -> BusAddress {
        self.address
    }

    /// Read one row.
    ///
    /// # Errors
    /// [`Error::OutOfRange`] before anything is sent if the row doesn't exist,
    /// [`Error::NoResponse`] if the device doesn't answer.
    pub fn read_row(&self, row: impl Into<i64>) -> Result<RowData, Error> {
        let row = check_row(row.into(), self.device.memory_size)?;
        self.fetch(row)
    }

    /// Write one row and read it back.
    ///
    /// # Errors
    /// [`Error::VerificationFailed`] if the device doesn't hold `value` afterwards.
    /// Failed writes are not retried.
    pub fn write_row(&self, row: impl Into<i64>, value: RowData) -> Result<(), Error> {
        let row = check_row(row.into(), self.device.memory_size)?;
        let timeout = self.master.config().exchange_timeout;
        self.master.exchange(
            Telegram::SelectDevice(*self.address),
            timeout,
            |t| matches!(t, Telegram::Control(c) if !c.request && c.org == org::SELECT),
        )?;
        self.master.exchange(
            Telegram::WriteRow { row, value },
            timeout,
            |t| matches!(t, Telegram::Control(c) if !c.request && c.org == org::WRITE),
        )?;
        let stored = self.fetch(row)?;
        ensure!(
            stored == value,
            VerificationFailedSnafu {
                address: *self.address,
                row
            }
        );
        debug!("Wrote row {} of {}", row, self.address);
        Ok(())
    }

    /// Read the whole memory.
    pub fn read_all(&self) -> Result<Vec<RowData>, Error> {
        (0..self.device.memory_size).map(|row| self.fetch(row)).collect()
    }

    /// The sensors programmed into the given rows.
    pub fn sensors(&self, rows: Range<u8>) -> Result<Vec<SensorEntry>, Error> {
        let mut sensors = Vec::new();
        for row in rows {
            let row = check_row(row.into(), self.device.memory_size)?;
            if let Some(entry) = SensorEntry::from_row(row, &self.fetch(row)?) {
                sensors.push(entry);
            }
        }
        Ok(sensors)
    }

    /// The radio base id of a gateway, kept in row 1.
    pub fn base_id(&self) -> Result<RadioId, Error> {
        let row = self.read_row(1)?;
        Ok(RadioId::from_bytes([row[0], row[1], row[2], row[3]]))
    }

    /// End the session and unlock the bus.
    pub fn lock(mut self) -> Result<(), Error> {
        self.close()
    }

    fn fetch(&self, row: u8) -> Result<RowData, Error> {
        let response = self.master.exchange(
            Telegram::MemoryRequest {
                address: *self.address,
                row,
            },
            self.master.config().exchange_timeout,
            move |t| matches!(t, Telegram::MemoryResponse { row: r, .. } if *r == row),
        )?;
        match response {
            Telegram::MemoryResponse { value, .. } => Ok(value),
            response => Err(Error::UnexpectedResponse { response }),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let unlocked = self.master.unlock_bus();
        self.master.memory_lock().release();
        info!("Memory of {} locked", self.device);
        unlocked.map(|_| ())
    }
}

impl Drop for MemorySession<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Unlocking the bus failed: {}", e);
        }
    }
}

/// A sensor programmed into a device's function group memory: one row holding
/// the sender id, the key, the key function and a channel bitmask.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SensorEntry {
    pub row: u8,
    pub sender: RadioId,
    pub key: u8,
    pub function: KeyFunction,
    /// Bit n set: the sensor acts on channel n + 1. Zero means all channels.
    pub channels: u8,
}

impl SensorEntry {
    /// Interpret a memory row. Rows with a zero sender id are empty.
    pub fn from_row(row: u8, data: &RowData) -> Option<Self> {
        let sender = RadioId::from_bytes([data[0], data[1], data[2], data[3]]);
        if *sender == 0 {
            return None;
        }
        Some(Self {
            row,
            sender,
            key: data[4],
            function: KeyFunction::from_code(data[5]),
            channels: data[6],
        })
    }

    /// Bus addresses of the channels the sensor acts on, for a device at `base`.
    pub fn addresses(&self, base: BusAddress) -> Vec<BusAddress> {
        if self.channels == 0 {
            return vec![base];
        }
        (0..8u8)
            .filter(|bit| self.channels & (1 << bit) != 0)
            .filter_map(|bit| base.offset(bit))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_check_row() {
        assert_eq!(check_row(0, 16), Ok(0));
        assert_eq!(check_row(15, 16), Ok(15));
        assert_eq!(
            check_row(16, 16),
            Err(Error::OutOfRange {
                row: 16,
                memory_size: 16
            })
        );
        assert_eq!(
            check_row(-1, 16),
            Err(Error::OutOfRange {
                row: -1,
                memory_size: 16
            })
        );
        assert!(check_row(256, 255).is_err());
        assert!(check_row(0, 0).is_err());
    }

    #[test]
    fn test_try_acquire() {
        let memory = MemoryLock::default();
        memory.try_acquire(addr(1)).unwrap();
        assert_eq!(memory.try_acquire(addr(2)), Err(Error::Busy));
        memory.release();
        memory.try_acquire(addr(2)).unwrap();
    }

    #[test]
    fn test_acquire_waits() {
        let memory = Arc::new(MemoryLock::default());
        memory.acquire(addr(1));
        let granted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let memory = Arc::clone(&memory);
            let granted = Arc::clone(&granted);
            thread::spawn(move || {
                memory.acquire(addr(2));
                granted.store(true, Ordering::SeqCst);
                memory.release();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!granted.load(Ordering::SeqCst));
        memory.release();
        waiter.join().unwrap();
        assert!(granted.load(Ordering::SeqCst));
        memory.try_acquire(addr(3)).unwrap();
    }

    #[test]
    fn test_sensor_entry() {
        let row = [0xfe, 0xf0, 0x01, 0x02, 0x10, 0x20, 0b0000_0101, 0x00];
        let entry = SensorEntry::from_row(9, &row).unwrap();
        assert_eq!(entry.sender, RadioId::from_bytes([0xfe, 0xf0, 0x01, 0x02]));
        assert_eq!(entry.key, 0x10);
        assert_eq!(entry.function, KeyFunction::DimmingValueFromController);
        assert_eq!(entry.addresses(addr(4)), vec![addr(4), addr(6)]);

        let all = SensorEntry {
            channels: 0,
            ..entry
        };
        assert_eq!(all.addresses(addr(4)), vec![addr(4)]);
        assert_eq!(SensorEntry::from_row(9, &[0; 8]), None);
    }
}
