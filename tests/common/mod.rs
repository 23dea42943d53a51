#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Error, ErrorKind};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use eltako_bus::codec;
use eltako_bus::telegram::{org, ControlTelegram, DEVICE_FLAGS, FAM_FLAGS};
use eltako_bus::transport::Link;
use eltako_bus::{
    ConnectionState, Connector, Decoded, Decoder, Diagnostic, DiscoveryReply, Event,
    MasterConfig, RadioId, RadioTelegram, RowData, Telegram, Transport, TransportConfig,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A bus device as the simulated bus sees it.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub address: u8,
    pub size: u8,
    pub model: [u8; 4],
    pub memory: Vec<RowData>,
    /// Acknowledge row writes without storing them.
    pub drop_writes: bool,
    /// Status code sent when force polled.
    pub status: u8,
}

impl SimDevice {
    /// An FSR14-1x relay with 32 rows of memory.
    pub fn relay(address: u8) -> Self {
        let mut memory = vec![[0u8; 8]; 32];
        memory[0] = [address; 8];
        Self {
            address,
            size: 1,
            model: [0x04, 0x01, 0x11, 0x00],
            memory,
            drop_writes: false,
            status: 0x70,
        }
    }

    /// An FSB14 shutter actuator, occupying two addresses.
    pub fn shutter(address: u8) -> Self {
        Self {
            size: 2,
            model: [0x04, 0x06, 0x11, 0x00],
            status: 0x50,
            ..Self::relay(address)
        }
    }

    fn discovery_reply(&self) -> DiscoveryReply {
        DiscoveryReply {
            address: self.address,
            size: self.size,
            memory_size: self.memory.len() as u8,
            flags: DEVICE_FLAGS,
            model: self.model,
        }
    }
}

fn response(org: u8, address: u8) -> Telegram {
    Telegram::Control(ControlTelegram {
        request: false,
        org,
        payload: [0; 8],
        address,
    })
}

#[derive(Default)]
struct SimState {
    fam: bool,
    devices: Vec<SimDevice>,
    learner: Option<SimDevice>,
    selected: Option<u8>,
    to_host: VecDeque<u8>,
    written: Vec<Telegram>,
    written_at: Vec<Instant>,
    /// Addresses a FAM busy polling reports, one per bus lock request.
    polls: VecDeque<u8>,
    refuse_opens: usize,
    opens: usize,
    fail_reads: bool,
    silent: bool,
}

impl SimState {
    fn respond(&mut self, request: &Telegram) -> Option<Telegram> {
        let timeout = if self.fam {
            Some(Telegram::Timeout)
        } else {
            None
        };
        if self.silent {
            return None;
        }
        match *request {
            Telegram::Lock if !self.polls.is_empty() => {
                self.polls.pop_front().map(Telegram::DiscoveryRequest)
            }
            Telegram::Lock | Telegram::Unlock => self.fam.then(|| {
                Telegram::DiscoveryReply(DiscoveryReply {
                    address: 0,
                    size: 1,
                    memory_size: 0x7f,
                    flags: FAM_FLAGS,
                    model: [0x07, 0xff, 0x00, 0x00],
                })
            }),
            Telegram::DiscoveryRequest(0) => match &self.learner {
                Some(learner) => Some(Telegram::DiscoveryReply(DiscoveryReply {
                    address: 0,
                    ..learner.discovery_reply()
                })),
                None => timeout,
            },
            Telegram::DiscoveryRequest(a) => self
                .device(a)
                .map(|d| Telegram::DiscoveryReply(d.discovery_reply()))
                .or(timeout),
            Telegram::AssignAddress(a) => match self.learner.take() {
                Some(mut learner) => {
                    learner.address = a;
                    let reply = learner.discovery_reply();
                    self.devices.push(learner);
                    Some(Telegram::DiscoveryReply(reply))
                }
                None => timeout,
            },
            Telegram::MemoryRequest { address, row } => self
                .device(address)
                .and_then(|d| d.memory.get(row as usize))
                .map(|value| Telegram::MemoryResponse { row, value: *value })
                .or(timeout),
            Telegram::SelectDevice(a) => match self.device(a) {
                Some(_) => {
                    self.selected = Some(a);
                    Some(response(org::SELECT, a))
                }
                None => timeout,
            },
            Telegram::WriteRow { row, value } => {
                let selected = self.selected?;
                let device = self.devices.iter_mut().find(|d| d.address == selected)?;
                if !device.drop_writes {
                    *device.memory.get_mut(row as usize)? = value;
                }
                Some(response(org::WRITE, row))
            }
            Telegram::PollForced(a) => self
                .device(a)
                .map(|d| {
                    let sender = RadioId::from_bytes([0, 0, 0, a]);
                    Telegram::BusStatus(RadioTelegram::rps(sender, d.status, 0x30))
                })
                .or(timeout),
            Telegram::Identify(a) => self
                .device(a)
                .map(|_| response(org::IDENTIFY, a))
                .or(timeout),
            _ => None,
        }
    }

    fn device(&self, address: u8) -> Option<&SimDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    fn push(&mut self, telegram: &Telegram) {
        self.to_host.extend(codec::serialize(telegram).iter());
    }
}

/// In-memory RS485 bus with a FAM and bus devices answering the host.
#[derive(Default)]
pub struct SimBus {
    state: Mutex<SimState>,
    data_available: Condvar,
}

impl SimBus {
    pub fn new() -> Arc<SimBus> {
        Arc::new(SimBus::default())
    }

    pub fn with_fam() -> Arc<SimBus> {
        let bus = Self::new();
        bus.state.lock().unwrap().fam = true;
        bus
    }

    pub fn connector(self: &Arc<Self>) -> SimConnector {
        SimConnector(Arc::clone(self))
    }

    pub fn add_device(&self, device: SimDevice) {
        self.state.lock().unwrap().devices.push(device);
    }

    /// Put a device into address learning mode.
    pub fn set_learner(&self, device: SimDevice) {
        self.state.lock().unwrap().learner = Some(device);
    }

    pub fn memory(&self, address: u8) -> Vec<RowData> {
        let state = self.state.lock().unwrap();
        state.device(address).map(|d| d.memory.clone()).unwrap_or_default()
    }

    /// Send a telegram to the host.
    pub fn inject(&self, telegram: &Telegram) {
        self.inject_bytes(&codec::serialize(telegram));
    }

    pub fn inject_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().to_host.extend(bytes.iter());
        self.data_available.notify_all();
    }

    /// Telegrams the host wrote.
    pub fn written(&self) -> Vec<Telegram> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn clear_written(&self) {
        let mut state = self.state.lock().unwrap();
        state.written.clear();
        state.written_at.clear();
    }

    /// When the host wrote each telegram.
    pub fn written_at(&self) -> Vec<Instant> {
        self.state.lock().unwrap().written_at.clone()
    }

    /// Answer the next bus locks with the FAM polling these addresses, one per lock.
    pub fn fam_polls(&self, addresses: &[u8]) {
        self.state.lock().unwrap().polls.extend(addresses.iter());
    }

    /// Make the next read fail with an I/O error.
    pub fn fail_next_read(&self) {
        self.state.lock().unwrap().fail_reads = true;
        self.data_available.notify_all();
    }

    pub fn refuse_opens(&self, n: usize) {
        self.state.lock().unwrap().refuse_opens = n;
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Stop answering requests.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }
}

pub struct SimConnector(Arc<SimBus>);

impl Connector for SimConnector {
    fn connect(&mut self) -> std::io::Result<Box<dyn Link>> {
        let mut state = self.0.state.lock().unwrap();
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(Error::new(ErrorKind::NotFound, "simulated port missing"));
        }
        state.opens += 1;
        Ok(Box::new(SimLink {
            bus: Arc::clone(&self.0),
            decoder: Decoder::new(),
        }))
    }
}

struct SimLink {
    bus: Arc<SimBus>,
    decoder: Decoder,
}

impl std::io::Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.bus.state.lock().unwrap();
        if state.to_host.is_empty() && !state.fail_reads {
            state = self
                .bus
                .data_available
                .wait_timeout(state, Duration::from_millis(5))
                .unwrap()
                .0;
        }
        if state.fail_reads {
            state.fail_reads = false;
            return Err(Error::new(ErrorKind::BrokenPipe, "simulated read error"));
        }
        if state.to_host.is_empty() {
            return Err(Error::new(ErrorKind::TimedOut, "simulated read timeout"));
        }
        let len = buf.len().min(state.to_host.len());
        for (dst, src) in buf.iter_mut().zip(state.to_host.drain(..len)) {
            *dst = src;
        }
        Ok(len)
    }
}

impl std::io::Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.decoder.feed(buf);
        let mut state = self.bus.state.lock().unwrap();
        for item in &mut self.decoder {
            if let Decoded::Telegram(telegram) = item {
                state.written.push(telegram);
                state.written_at.push(Instant::now());
                if let Some(answer) = state.respond(&telegram) {
                    state.push(&answer);
                }
            }
        }
        self.bus.data_available.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn transport_config() -> TransportConfig {
    TransportConfig {
        reconnect_delay: Duration::from_millis(10),
        max_reconnect_delay: Duration::from_millis(40),
        send_delay: Duration::ZERO,
        burst_limit: 0,
        ..Default::default()
    }
}

pub fn master_config() -> MasterConfig {
    MasterConfig {
        exchange_timeout: Duration::from_millis(500),
        discovery_timeout: Duration::from_millis(200),
        lock_attempts: 2,
        cache_while_locked: true,
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Start a transport on the simulated bus and wait until it is connected.
pub fn connect(bus: &Arc<SimBus>) -> Transport {
    let transport = Transport::start(bus.connector(), transport_config()).unwrap();
    assert!(wait_for(Duration::from_secs(2), || transport.state()
        == ConnectionState::Connected));
    transport
}

pub fn events(transport: &Transport) -> mpsc::Receiver<Event> {
    let (tx, rx) = mpsc::channel();
    transport.subscribe_events(move |e| {
        let _ = tx.send(e.clone());
    });
    rx
}

pub fn diagnostics(transport: &Transport) -> mpsc::Receiver<Diagnostic> {
    let (tx, rx) = mpsc::channel();
    transport.subscribe_diagnostics(move |d| {
        let _ = tx.send(d.clone());
    });
    rx
}

/// Everything received until `timeout` passes without a new item.
pub fn drain<T>(rx: &mpsc::Receiver<T>, timeout: Duration) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.recv_timeout(timeout) {
        items.push(item);
    }
    items
}
