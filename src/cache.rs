//! Answers of the bus that can't change while the bus is locked.
//!
//! Once a FAM acknowledged the bus lock, only the host talks on the bus, so a
//! discovery reply or a memory row stays what it was when it was last read. The
//! [`BusCache`] hands those out again without asking the device, until the bus
//! is unlocked. Selecting a device for writing drops its rows, and assigning an
//! address drops all discovery results.

use std::collections::HashMap;

use log::trace;

use crate::telegram::Telegram;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum Key {
    Discovery(u8),
    Row { address: u8, row: u8 },
}

impl Key {
    fn of(request: &Telegram) -> Option<Key> {
        match *request {
            // address 0 is whatever device is in learning mode right now
            Telegram::DiscoveryRequest(a) if a != 0 => Some(Key::Discovery(a)),
            Telegram::MemoryRequest { address, row } => Some(Key::Row { address, row }),
            _ => None,
        }
    }

    fn accepts(&self, response: Option<&Telegram>) -> bool {
        match (self, response) {
            (_, None) => true,
            (Key::Discovery(_), Some(Telegram::DiscoveryReply(_))) => true,
            (Key::Row { .. }, Some(Telegram::MemoryResponse { .. })) => true,
            _ => false,
        }
    }
}

/// Responses to discovery and memory requests, recorded while the bus is locked.
///
/// `None` entries record a request nobody answered.
#[derive(Debug, Default)]
pub struct BusCache {
    active: bool,
    entries: HashMap<Key, Option<Telegram>>,
}

impl BusCache {
    /// Start recording, the bus is locked now.
    pub(crate) fn start(&mut self) {
        if !self.active {
            trace!("Bus cache started");
        }
        self.active = true;
    }

    /// Stop recording and forget everything.
    pub(crate) fn stop(&mut self) {
        if self.active {
            trace!("Bus cache dropped {} entries", self.entries.len());
        }
        self.active = false;
        self.entries.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Number of recorded responses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The recorded response to `request`. The outer `None` means the bus has to be asked.
    pub(crate) fn lookup(&self, request: &Telegram) -> Option<Option<Telegram>> {
        if !self.active {
            return None;
        }
        Key::of(request).and_then(|key| self.entries.get(&key).copied())
    }

    /// Drop what `request` is about to change.
    pub(crate) fn invalidate(&mut self, request: &Telegram) {
        match *request {
            Telegram::SelectDevice(a) => self
                .entries
                .retain(|key, _| !matches!(key, Key::Row { address, .. } if *address == a)),
            Telegram::AssignAddress(_) => self
                .entries
                .retain(|key, _| !matches!(key, Key::Discovery(_))),
            _ => {}
        }
    }

    /// Record the response to `request`, if it is one worth keeping.
    pub(crate) fn store(&mut self, request: &Telegram, response: Option<&Telegram>) {
        if !self.active {
            return;
        }
        if let Some(key) = Key::of(request).filter(|key| key.accepts(response)) {
            self.entries.insert(key, response.copied());
        }
    }
}
