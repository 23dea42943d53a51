//! The bus master.
//!
//! [`Master`] runs on top of a [`Transport`] and provides the commands an
//! application uses on the bus: discovery and scanning, address assignment,
//! memory sessions, polling and sending telegrams. Requests and their responses
//! are correlated by matching received telegrams; since the bus is half duplex,
//! exchanges are serialized.
//!
//! The master also keeps the device table, fed by a listener on the transport:
//! discovery replies and status telegrams update the [`AddressSpace`], radio
//! teach-in telegrams record the profile of radio senders.
//!
//! While a FAM acknowledged the bus lock, discovery replies and memory rows are
//! kept in a [`BusCache`] and not asked for again until the bus is unlocked.
//! Scans lock the bus for their duration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, trace, warn};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::address::AddressSpace;
use crate::cache::BusCache;
use crate::codec::{self, MalformedFrame};
use crate::device::{Device, DeviceId};
use crate::eep::{self, Command, DecodeError, EncodeError, Eep, Reading};
use crate::lock;
use crate::memory::{MemoryLock, MemorySession};
use crate::programming::DirectCommand;
use crate::telegram::{org, DiscoveryReply, RadioTelegram, Telegram};
use crate::transport::{Event, EventSink, Transport};
use crate::types::{self, BusAddress, IntoBusAddress, RadioId};

/// Errors of bus commands
#[derive(Debug, Snafu, Clone, PartialEq)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// Nothing answered in time, or the FAM reported a timeout.
    #[snafu(display("No response from address {address}"))]
    NoResponse { address: u8 },
    /// Memory access is held by another session.
    #[snafu(display("Memory access is busy"))]
    Busy,
    #[snafu(display("Address {address} is in use"))]
    AddressInUse { address: u8 },
    #[snafu(display("No {size} consecutive free bus addresses left"))]
    AddressSpaceExhausted { size: u8 },
    #[snafu(display("Row {row} outside of memory size {memory_size}"))]
    OutOfRange { row: i64, memory_size: u8 },
    /// A written row reads back different content.
    #[snafu(display("Row {row} of {address} didn't verify after writing"))]
    VerificationFailed { address: u8, row: u8 },
    #[snafu(display("No device in address learning mode"))]
    NotInAddressMode,
    #[snafu(display("Unexpected response: {response}"))]
    UnexpectedResponse { response: Telegram },
    #[snafu(display("Transport is closed"))]
    Closed,
    #[snafu(display("{device} is not a bus device"))]
    NotOnBus { device: DeviceId },
    #[snafu(display("{source}"))]
    Malformed { source: MalformedFrame },
    #[snafu(display("{source}"))]
    InvalidId { source: types::Error },
    #[snafu(display("{source}"))]
    Encode { source: EncodeError },
    #[snafu(display("{source}"))]
    Decode { source: DecodeError },
    /// The FAM went back to lower addresses while being locked, it runs in an
    /// operating mode that ignores bus locks.
    #[snafu(display("The FAM can't be locked in its current operating mode"))]
    BadFamMode,
    #[snafu(display("{device} has no programmable rows"))]
    NotProgrammable { device: DeviceId },
    #[snafu(display("Senders of profile {profile} can't be programmed"))]
    UnsupportedSource { profile: Eep },
    #[snafu(display("No empty row left on {address}"))]
    MemoryFull { address: u8 },
    #[snafu(display("Channel {channel} outside of {size} channels"))]
    NoSuchChannel { channel: u8, size: u8 },
}

/// Timeouts and behavior of the master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// How long to wait for the response to a request.
    pub exchange_timeout: Duration,
    /// How long to wait for a discovery reply; short, as most scanned addresses are empty.
    pub discovery_timeout: Duration,
    /// Bus lock requests sent before assuming there is no FAM on the bus.
    /// Attempts during which the FAM still polls higher addresses don't count.
    pub lock_attempts: u32,
    /// Keep discovery replies and memory rows while the bus is locked.
    pub cache_while_locked: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(1),
            discovery_timeout: Duration::from_millis(300),
            lock_attempts: 5,
            cache_while_locked: true,
        }
    }
}

/// Cooperative cancellation of long running commands.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of discovering one address during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanStep {
    pub address: BusAddress,
    pub outcome: Result<Device, Error>,
}

/// Sequential discovery of an address range, see [`Master::scan_range`].
///
/// Each call to `next` discovers one address. After a device that occupies several
/// addresses, the scan continues behind its last channel.
///
/// The bus is locked before the first discovery and unlocked when the scan ends, is
/// cancelled or dropped. A scan goes on unlocked if locking fails.
pub struct Scan<'a> {
    master: &'a Master,
    next: Option<BusAddress>,
    last: BusAddress,
    cancel: CancelToken,
    /// None until the first discovery, then whether a FAM acknowledged the lock.
    locked: Option<bool>,
}

impl Scan<'_> {
    /// Token to stop the scan from another thread, between two addresses.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Use an existing token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn finish(&mut self) {
        self.next = None;
        if self.locked.replace(false) == Some(true) {
            if let Err(e) = self.master.unlock_bus() {
                warn!("Unlocking the bus after the scan failed: {}", e);
            }
        }
    }
}

impl Iterator for Scan<'_> {
    type Item = ScanStep;

    fn next(&mut self) -> Option<ScanStep> {
        let address = match self.next.filter(|a| *a <= self.last) {
            Some(address) => address,
            None => {
                self.finish();
                return None;
            }
        };
        if self.cancel.is_cancelled() {
            debug!("Scan cancelled before {}", address);
            self.finish();
            return None;
        }
        if self.locked.is_none() {
            self.locked = match self.master.lock_bus() {
                Ok(locked) => Some(locked),
                Err(e) => {
                    warn!("Scanning without bus lock: {}", e);
                    Some(false)
                }
            };
        }
        let outcome = self.master.discover(address);
        self.next = match &outcome {
            Ok(device) => address.offset(device.size.max(1)),
            Err(Error::Closed) => None,
            Err(_) => address.next(),
        };
        Some(ScanStep { address, outcome })
    }
}

impl Drop for Scan<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

type Directory = Arc<Mutex<AddressSpace>>;
type RadioDevices = Arc<Mutex<HashMap<RadioId, Device>>>;
type Polls = Arc<Mutex<Polling>>;

/// Progress of the FAM polling the bus, observed while locking it.
#[derive(Debug, Default)]
struct Polling {
    highest: u8,
    went_back: bool,
}

impl Polling {
    fn seen(&mut self, address: u8) {
        if address < self.highest {
            self.went_back = true;
        }
        self.highest = self.highest.max(address);
    }
}

/// Keep the device tables current with what is seen on the bus.
fn track(
    telegram: &Telegram,
    directory: &Directory,
    radio: &RadioDevices,
    polls: &Polls,
    sink: &EventSink,
) {
    let discovered = match telegram {
        Telegram::DiscoveryRequest(a) => {
            lock(polls).seen(*a);
            None
        }
        Telegram::DiscoveryReply(reply) if !reply.is_fam() => BusAddress::new(reply.address)
            .ok()
            .map(|address| Device::from_discovery(address, reply))
            .filter(|device| lock(directory).confirm(device.clone())),
        Telegram::BusStatus(status) => status
            .sender
            .bus_address()
            .map(|address| Device::tentative(DeviceId::Bus(address)))
            .filter(|device| lock(directory).observe(device.clone())),
        Telegram::RadioReceived(r) => {
            let mut radio = lock(radio);
            match r.teach_in() {
                Some(teach_in) => {
                    let device = Device::radio(r.sender, Some(teach_in.profile));
                    let changed = radio.get(&r.sender) != Some(&device);
                    radio.insert(r.sender, device.clone());
                    changed.then(|| device)
                }
                None => {
                    radio
                        .entry(r.sender)
                        .or_insert_with(|| Device::radio(r.sender, None));
                    None
                }
            }
        }
        _ => None,
    };
    if let Some(device) = discovered {
        info!("Discovered {}", device);
        sink.emit(Event::DeviceDiscovered(device));
    }
}

/// Bus master on top of a [`Transport`].
pub struct Master {
    transport: Transport,
    config: MasterConfig,
    exchange: Mutex<()>,
    directory: Directory,
    radio: RadioDevices,
    learning: Mutex<Option<DiscoveryReply>>,
    memory: MemoryLock,
    cache: Mutex<BusCache>,
    polls: Polls,
}

impl Master {
    pub fn new(transport: Transport, config: MasterConfig) -> Self {
        let directory = Directory::default();
        let radio = RadioDevices::default();
        let polls = Polls::default();
        {
            let directory = Arc::clone(&directory);
            let radio = Arc::clone(&radio);
            let polls = Arc::clone(&polls);
            let sink = transport.event_sink();
            transport.subscribe(move |telegram| track(telegram, &directory, &radio, &polls, &sink));
        }
        Self {
            transport,
            config,
            exchange: Mutex::new(()),
            directory,
            radio,
            learning: Mutex::new(None),
            memory: MemoryLock::default(),
            cache: Mutex::new(BusCache::default()),
            polls,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub(crate) fn memory_lock(&self) -> &MemoryLock {
        &self.memory
    }

    /// Send `request` and wait for the first telegram `matches` accepts.
    ///
    /// A timeout telegram from the FAM ends the wait early. While the bus is
    /// locked, requests the cache has an answer for are not sent.
    pub(crate) fn exchange(
        &self,
        request: Telegram,
        timeout: Duration,
        matches: impl Fn(&Telegram) -> bool + Send + 'static,
    ) -> Result<Telegram, Error> {
        ensure!(!self.transport.is_closed(), ClosedSnafu);
        let _bus = lock(&self.exchange);
        let address = request.target().unwrap_or(0);
        if let Some(cached) = lock(&self.cache).lookup(&request) {
            trace!("Cached: {}", request);
            return cached.context(NoResponseSnafu { address });
        }
        lock(&self.cache).invalidate(&request);
        let expectation = self
            .transport
            .expect(move |t| *t == Telegram::Timeout || matches(t));
        trace!("Request: {}", request);
        self.transport.send(request);
        let response = expectation
            .wait(timeout)
            .filter(|t| *t != Telegram::Timeout);
        lock(&self.cache).store(&request, response.as_ref());
        match response {
            None => NoResponseSnafu { address }.fail(),
            Some(response) => {
                trace!("Response: {}", response);
                Ok(response)
            }
        }
    }

    /// Look at the bus cache.
    pub fn with_cache<T>(&self, f: impl FnOnce(&BusCache) -> T) -> T {
        f(&lock(&self.cache))
    }

    /// Ask the device at `address` to describe itself.
    ///
    /// A device answering with its status telegram instead of a discovery reply
    /// is reported as far as it is known.
    ///
    /// # Errors
    /// [`Error::InvalidId`] if `address` is no bus address,
    /// [`Error::NoResponse`] if nothing answers; occupancy is left unchanged then.
    pub fn discover(&self, address: impl IntoBusAddress) -> Result<Device, Error> {
        let address = address.into_bus_address().context(InvalidIdSnafu)?;
        let a = *address;
        let response = self.exchange(
            Telegram::DiscoveryRequest(a),
            self.config.discovery_timeout,
            move |t| match t {
                Telegram::DiscoveryReply(reply) => reply.address == a && !reply.is_fam(),
                Telegram::BusStatus(status) => status.sender.bus_address() == Some(address),
                _ => false,
            },
        )?;
        match response {
            Telegram::DiscoveryReply(reply) => Ok(Device::from_discovery(address, &reply)),
            _ => Ok(self
                .device(address)
                .unwrap_or_else(|| Device::tentative(DeviceId::Bus(address)))),
        }
    }

    /// Discover the addresses `first..=last` one by one.
    ///
    /// ## Example
    /// ```no_run
    /// # fn f(master: &eltako_bus::Master) {
    /// use eltako_bus::addr;
    ///
    /// let scan = master.scan_range(addr(1), addr(127));
    /// let cancel = scan.cancel_token(); // hand this to another thread to stop the scan
    /// for step in scan {
    ///     match step.outcome {
    ///         Ok(device) => println!("{}: {}", step.address, device),
    ///         Err(e) => println!("{}: {}", step.address, e),
    ///     }
    /// }
    /// # }
    /// ```
    pub fn scan_range(&self, first: BusAddress, last: BusAddress) -> Scan<'_> {
        Scan {
            master: self,
            next: Some(first),
            last,
            cancel: CancelToken::new(),
            locked: None,
        }
    }

    /// Look for a device in address learning mode and hold it as the pending device.
    pub fn enter_address_mode(&self) -> Result<DiscoveryReply, Error> {
        let response = self.exchange(
            Telegram::DiscoveryRequest(0),
            self.config.discovery_timeout,
            |t| matches!(t, Telegram::DiscoveryReply(r) if r.address == 0 && !r.is_fam()),
        )?;
        let reply = match response {
            Telegram::DiscoveryReply(reply) => reply,
            response => return UnexpectedResponseSnafu { response }.fail(),
        };
        info!(
            "Device in learning mode, model {} size {}",
            crate::Hex(&reply.model),
            reply.size
        );
        *lock(&self.learning) = Some(reply);
        Ok(reply)
    }

    /// Forget the pending device. The device leaves learning mode on its own.
    pub fn exit_address_mode(&self) {
        if lock(&self.learning).take().is_some() {
            debug!("Left address mode");
        }
    }

    /// Assign a bus address to the pending device, at `target` or the lowest free range.
    ///
    /// # Errors
    /// [`Error::NotInAddressMode`] without a pending device,
    /// [`Error::AddressInUse`] if `target` isn't free,
    /// [`Error::AddressSpaceExhausted`] if no range large enough is left.
    pub fn assign(&self, target: Option<BusAddress>) -> Result<Device, Error> {
        let pending = (*lock(&self.learning)).context(NotInAddressModeSnafu)?;
        let size = pending.size.max(1);
        let base = lock(&self.directory).reserve(target, size)?;
        let a = *base;
        let result = self.exchange(
            Telegram::AssignAddress(a),
            self.config.exchange_timeout,
            |t| matches!(t, Telegram::DiscoveryReply(r) if !r.is_fam()),
        );
        match result {
            Ok(Telegram::DiscoveryReply(reply)) if reply.address == a => {
                lock(&self.learning).take();
                let device = Device::from_discovery(base, &reply);
                info!("Assigned {}", device);
                Ok(device)
            }
            Ok(response) => {
                lock(&self.directory).release(base);
                warn!("Assigning {} failed: {}", base, response);
                UnexpectedResponseSnafu { response }.fail()
            }
            Err(e) => {
                lock(&self.directory).release(base);
                Err(e)
            }
        }
    }

    /// Open the memory session for `device`, waiting while another session is open.
    pub fn unlock_memory(&self, device: &Device) -> Result<MemorySession<'_>, Error> {
        MemorySession::open(self, device, true)
    }

    /// Open the memory session for `device`.
    ///
    /// # Errors
    /// [`Error::Busy`] if another session is open.
    pub fn try_unlock_memory(&self, device: &Device) -> Result<MemorySession<'_>, Error> {
        MemorySession::open(self, device, false)
    }

    /// Stop the FAM from polling the bus.
    ///
    /// Returns false if no FAM acknowledged the lock, which is normal on a bus
    /// without FAM. A FAM busy polling finishes its round before it answers, so
    /// attempts during which it polled higher addresses are not counted.
    ///
    /// # Errors
    /// [`Error::BadFamMode`] if the FAM polls lower addresses again.
    pub fn lock_bus(&self) -> Result<bool, Error> {
        *lock(&self.polls) = Polling::default();
        let mut attempt = 0;
        while attempt < self.config.lock_attempts {
            let before = lock(&self.polls).highest;
            match self.exchange(Telegram::Lock, self.config.exchange_timeout, is_fam_reply) {
                Ok(_) => {
                    debug!("Bus locked");
                    if self.config.cache_while_locked {
                        lock(&self.cache).start();
                    }
                    return Ok(true);
                }
                Err(Error::NoResponse { .. }) => {}
                Err(e) => return Err(e),
            }
            let polls = lock(&self.polls);
            ensure!(!polls.went_back, BadFamModeSnafu);
            if polls.highest > before {
                debug!("FAM still polling, at address {}", polls.highest);
            } else {
                attempt += 1;
                debug!("Bus lock attempt {} unanswered", attempt);
            }
        }
        warn!("No FAM acknowledged the bus lock, assuming there is none");
        Ok(false)
    }

    /// Let the FAM resume polling. Returns false if no FAM acknowledged.
    pub fn unlock_bus(&self) -> Result<bool, Error> {
        lock(&self.cache).stop();
        match self.exchange(Telegram::Unlock, self.config.exchange_timeout, is_fam_reply) {
            Ok(_) => {
                debug!("Bus unlocked");
                Ok(true)
            }
            Err(Error::NoResponse { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask a device for its current status telegram.
    pub fn poll_status(&self, address: impl IntoBusAddress) -> Result<RadioTelegram, Error> {
        let address = address.into_bus_address().context(InvalidIdSnafu)?;
        let response = self.exchange(
            Telegram::PollForced(*address),
            self.config.exchange_timeout,
            move |t| matches!(t, Telegram::BusStatus(s) if s.sender.bus_address() == Some(address)),
        )?;
        match response {
            Telegram::BusStatus(status) => Ok(status),
            response => UnexpectedResponseSnafu { response }.fail(),
        }
    }

    /// Make a device blink its LED.
    pub fn identify(&self, address: impl IntoBusAddress) -> Result<(), Error> {
        let address = address.into_bus_address().context(InvalidIdSnafu)?;
        self.exchange(
            Telegram::Identify(*address),
            self.config.exchange_timeout,
            |t| matches!(t, Telegram::Control(c) if !c.request && c.org == org::IDENTIFY),
        )?;
        Ok(())
    }

    /// Queue a telegram for sending without waiting for anything.
    pub fn send(&self, telegram: Telegram) -> Result<(), Error> {
        ensure!(!self.transport.is_closed(), ClosedSnafu);
        self.transport.send(telegram);
        Ok(())
    }

    /// Validate a raw frame and send it.
    pub fn send_raw(&self, frame: &[u8]) -> Result<Telegram, Error> {
        let telegram = codec::parse(frame).context(MalformedSnafu)?;
        self.send(telegram)?;
        Ok(telegram)
    }

    /// Encode a command with the profile of the receiving device and transmit it by radio as `sender`.
    pub fn send_command(&self, sender: RadioId, profile: Eep, command: &Command) -> Result<(), Error> {
        let data = eep::encode(profile, command).context(EncodeSnafu)?;
        let radio = if profile.rorg.payload_len() == 1 {
            RadioTelegram::rps(sender, data[0], 0x30)
        } else {
            RadioTelegram::four_bs(sender, data, 0x00)
        };
        self.send(Telegram::RadioTransmit(radio))
    }

    /// Switch or dim an actuator channel programmed for `command`, see [`crate::programming`].
    pub fn set_state(&self, command: &DirectCommand, state: &Command) -> Result<(), Error> {
        let telegram = command.telegram(state).context(EncodeSnafu)?;
        debug!("Setting {:?} as {}", state, command.sender());
        self.send(telegram)
    }

    /// Decode a radio or status telegram with the profile of its sender.
    ///
    /// Returns None for other telegrams, and for senders without known profile.
    pub fn interpret(&self, telegram: &Telegram) -> Result<Option<(Device, Reading)>, Error> {
        let device = match telegram {
            Telegram::BusStatus(status) => status
                .sender
                .bus_address()
                .and_then(|address| self.device(address)),
            Telegram::RadioReceived(radio) => self.radio_device(radio.sender),
            _ => None,
        };
        let (device, radio) = match (device, telegram.radio()) {
            (Some(device), Some(radio)) => (device, radio),
            _ => return Ok(None),
        };
        let profile = match device.profile {
            Some(profile) => profile,
            None => return Ok(None),
        };
        let reading = eep::decode_radio(profile, radio).context(DecodeSnafu)?;
        Ok(Some((device, reading)))
    }

    /// The bus device occupying `address`.
    pub fn device(&self, address: BusAddress) -> Option<Device> {
        lock(&self.directory).device(address).cloned()
    }

    pub fn radio_device(&self, id: RadioId) -> Option<Device> {
        lock(&self.radio).get(&id).cloned()
    }

    /// Record the profile of a radio sender, e.g. from configuration.
    pub fn add_radio_device(&self, id: RadioId, profile: Eep) {
        lock(&self.radio).insert(id, Device::radio(id, Some(profile)));
    }

    /// All known devices, bus devices by address first.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = lock(&self.directory).devices().cloned().collect();
        let mut radio: Vec<Device> = lock(&self.radio).values().cloned().collect();
        radio.sort_by_key(|d| d.id);
        devices.extend(radio);
        devices
    }

    /// Snapshot of the address space.
    pub fn with_address_space<T>(&self, f: impl FnOnce(&AddressSpace) -> T) -> T {
        f(&lock(&self.directory))
    }

    /// Parse a bus address given as text.
    pub fn parse_address(text: &str) -> Result<BusAddress, Error> {
        let n: u8 = text
            .trim()
            .parse()
            .map_err(|_| types::Error::InvalidAddress)
            .context(InvalidIdSnafu)?;
        BusAddress::new(n).context(InvalidIdSnafu)
    }
}

fn is_fam_reply(telegram: &Telegram) -> bool {
    matches!(telegram, Telegram::DiscoveryReply(r) if r.is_fam())
}
