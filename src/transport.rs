//! Serial transport.
//!
//! A [`Transport`] owns the connection to the bus on a dedicated worker thread,
//! which writes queued telegrams, reads and decodes the receive stream and
//! dispatches what it decoded, in receipt order. The connection is an explicit
//! state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    ^              | I/O error
//!                    |   backoff    v
//!                    +------- Reconnecting
//! ```
//!
//! Any state goes to `Disconnected` on [`Transport::close`]. There is no other
//! terminal state, a failing link is retried with exponential backoff forever.
//!
//! Listeners run on the worker thread and must not block. A panicking listener
//! is reported as [`Diagnostic::ListenerPanicked`] and the worker carries on.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::codec::{self, Decoded, Decoder, MalformedFrame};
use crate::device::Device;
use crate::telegram::Telegram;
use crate::{lock, Hex};

/// Baud rate of the FAM14 and FGW14 bus gateways.
pub const DEFAULT_BAUD_RATE: u32 = 57600;
/// Baud rate of the FAM-USB gateway.
pub const FAM_USB_BAUD_RATE: u32 = 9600;

/// A byte stream to the bus.
///
/// Reads should time out after a short while when nothing arrives, returning
/// [`io::ErrorKind::TimedOut`] or [`io::ErrorKind::WouldBlock`]; the worker
/// writes queued telegrams between reads.
pub trait Link: Read + Write + Send {}

impl<T: Read + Write + Send> Link for T {}

/// Opens the link, initially and after every failure.
pub trait Connector: Send + 'static {
    fn connect(&mut self) -> io::Result<Box<dyn Link>>;
}

/// Connects to a serial port, 8N1 without flow control.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    path: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout: Duration::from_millis(20),
        }
    }

    /// Read timeout of the port, bounds the latency of queued sends.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for SerialConnector {
    fn connect(&mut self) -> io::Result<Box<dyn Link>> {
        let port = serialport::new(self.path.as_str(), self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()?;
        info!("Opened {} at {} baud", self.path, self.baud_rate);
        Ok(Box::new(port))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The link failed, waiting for the backoff delay before connecting again.
    Reconnecting,
}

/// Timing of the worker.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// First delay before reconnecting, doubled on every failed attempt.
    pub reconnect_delay: Duration,
    /// Ceiling of the reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Minimum gap between two telegrams sent.
    pub send_delay: Duration,
    /// Number of back to back telegrams after which to pause; 0 disables the pause.
    pub burst_limit: usize,
    /// Gap after a burst. A pause this long also ends a burst.
    pub burst_pause: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            send_delay: Duration::from_millis(1),
            burst_limit: 12,
            burst_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TelegramReceived(Telegram),
    /// A bus device was seen for the first time, or reported different details.
    DeviceDiscovered(Device),
    ConnectionStateChanged(ConnectionState),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A frame failed validation and was skipped.
    Malformed(MalformedFrame),
    ListenerPanicked { message: String },
    /// A queued telegram was discarded because the link failed.
    SendDropped(Telegram),
    IoFailure { kind: io::ErrorKind, message: String },
}

type TelegramListener = Box<dyn FnMut(&Telegram) + Send>;
type EventListener = Box<dyn FnMut(&Event) + Send>;
type DiagnosticListener = Box<dyn FnMut(&Diagnostic) + Send>;

struct Waiter {
    id: u64,
    matches: Box<dyn Fn(&Telegram) -> bool + Send>,
    tx: mpsc::Sender<Telegram>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    outbox: Mutex<VecDeque<Telegram>>,
    wakeup: Condvar,
    closed: AtomicBool,
    telegram_listeners: Mutex<Vec<TelegramListener>>,
    event_listeners: Mutex<Vec<EventListener>>,
    diagnostic_listeners: Mutex<Vec<DiagnosticListener>>,
    waiters: Mutex<Vec<Waiter>>,
    next_waiter: AtomicU64,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            outbox: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            closed: AtomicBool::new(false),
            telegram_listeners: Mutex::new(Vec::new()),
            event_listeners: Mutex::new(Vec::new()),
            diagnostic_listeners: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            next_waiter: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut current = lock(&self.state);
            if *current == state {
                return;
            }
            *current = state;
        }
        info!("Connection {:?}", state);
        self.emit(&Event::ConnectionStateChanged(state));
    }

    fn emit(&self, event: &Event) {
        let mut panicked = Vec::new();
        for listener in lock(&self.event_listeners).iter_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                panicked.push(panic_message(&*payload));
            }
        }
        for message in panicked {
            self.listener_panicked(message);
        }
    }

    fn diagnose(&self, diagnostic: &Diagnostic) {
        for listener in lock(&self.diagnostic_listeners).iter_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(diagnostic))) {
                error!("Diagnostics listener panicked: {}", panic_message(&*payload));
            }
        }
    }

    fn listener_panicked(&self, message: String) {
        error!("Listener panicked: {}", message);
        self.diagnose(&Diagnostic::ListenerPanicked { message });
    }

    fn dispatch(&self, telegram: Telegram) {
        trace!("Received {}", telegram);
        let mut panicked = Vec::new();
        for listener in lock(&self.telegram_listeners).iter_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&telegram))) {
                panicked.push(panic_message(&*payload));
            }
        }
        for message in panicked {
            self.listener_panicked(message);
        }
        self.emit(&Event::TelegramReceived(telegram));

        let mut waiters = lock(&self.waiters);
        if let Some(pos) = waiters.iter().position(|w| (w.matches)(&telegram)) {
            let waiter = waiters.remove(pos);
            // the waiter may have given up already
            let _ = waiter.tx.send(telegram);
        }
    }

    fn receive(&self, item: Decoded) {
        match item {
            Decoded::Telegram(telegram) => self.dispatch(telegram),
            Decoded::Malformed(frame) => {
                debug!("{}", frame);
                self.diagnose(&Diagnostic::Malformed(frame));
            }
        }
    }

    fn next_outgoing(&self) -> Option<Telegram> {
        lock(&self.outbox).pop_front()
    }

    fn drop_queued(&self) {
        let dropped: Vec<Telegram> = lock(&self.outbox).drain(..).collect();
        for telegram in dropped {
            warn!("Dropped unsent telegram: {}", telegram);
            self.diagnose(&Diagnostic::SendDropped(telegram));
        }
    }

    /// Sleep for `duration`, or until the transport is closed.
    fn sleep(&self, duration: Duration) {
        let outbox = lock(&self.outbox);
        let _ = self
            .wakeup
            .wait_timeout_while(outbox, duration, |_| !self.is_closed());
    }
}

/// Spaces out sent telegrams.
#[derive(Debug)]
struct Pacer {
    send_delay: Duration,
    burst_limit: usize,
    burst_pause: Duration,
    last: Option<Instant>,
    burst: usize,
}

impl Pacer {
    fn new(config: &TransportConfig) -> Self {
        Self {
            send_delay: config.send_delay,
            burst_limit: config.burst_limit,
            burst_pause: config.burst_pause,
            last: None,
            burst: 0,
        }
    }

    /// The time to wait before the next telegram may be sent.
    fn delay(&mut self, now: Instant) -> Duration {
        let last = match self.last {
            Some(last) => last,
            None => return Duration::ZERO,
        };
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= self.burst_pause {
            self.burst = 0;
        }
        let gap = if self.burst_limit > 0 && self.burst >= self.burst_limit {
            self.burst = 0;
            self.burst_pause
        } else {
            self.send_delay
        };
        gap.saturating_sub(elapsed)
    }

    fn sent(&mut self, now: Instant) {
        self.last = Some(now);
        self.burst += 1;
    }
}

fn is_idle(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

struct Worker {
    shared: Arc<Shared>,
    connector: Box<dyn Connector>,
    config: TransportConfig,
}

impl Worker {
    fn run(mut self) {
        let mut delay = self.config.reconnect_delay;
        while !self.shared.is_closed() {
            self.shared.set_state(ConnectionState::Connecting);
            let failure = match self.connector.connect() {
                Ok(link) => {
                    delay = self.config.reconnect_delay;
                    self.shared.set_state(ConnectionState::Connected);
                    match self.serve(link) {
                        Ok(()) => break,
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };
            if self.shared.is_closed() {
                break;
            }
            warn!("Link failed: {}, reconnecting in {:?}", failure, delay);
            self.shared.diagnose(&Diagnostic::IoFailure {
                kind: failure.kind(),
                message: failure.to_string(),
            });
            self.shared.set_state(ConnectionState::Reconnecting);
            self.shared.drop_queued();
            self.shared.sleep(delay);
            delay = (delay * 2).min(self.config.max_reconnect_delay);
        }
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("Worker stopped");
    }

    /// Run the connected link until it fails or the transport is closed.
    fn serve(&mut self, mut link: Box<dyn Link>) -> io::Result<()> {
        let mut decoder = Decoder::new();
        let mut pacer = Pacer::new(&self.config);
        let mut buf = [0u8; 64];
        loop {
            if self.shared.is_closed() {
                return Ok(());
            }
            while let Some(telegram) = self.shared.next_outgoing() {
                let delay = pacer.delay(Instant::now());
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                let frame = codec::serialize(&telegram);
                trace!("Sending {}", Hex(&frame));
                if let Err(e) = link.write_all(&frame).and_then(|_| link.flush()) {
                    self.shared.diagnose(&Diagnostic::SendDropped(telegram));
                    return Err(e);
                }
                pacer.sent(Instant::now());
            }
            match link.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "link closed by peer",
                    ))
                }
                Ok(n) => {
                    decoder.feed(&buf[..n]);
                    for item in &mut decoder {
                        self.shared.receive(item);
                    }
                }
                Err(e) if is_idle(e.kind()) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// A pending wait for a telegram, see [`Transport::expect`].
///
/// Dropping it withdraws the wait.
pub struct Expectation {
    id: u64,
    rx: mpsc::Receiver<Telegram>,
    shared: Arc<Shared>,
}

impl Expectation {
    /// Wait for the matching telegram. Returns None on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<Telegram> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for Expectation {
    fn drop(&mut self) {
        lock(&self.shared.waiters).retain(|w| w.id != self.id);
    }
}

/// Emits events on behalf of the transport, without keeping it alive.
#[derive(Clone)]
pub(crate) struct EventSink(Weak<Shared>);

impl EventSink {
    pub(crate) fn emit(&self, event: Event) {
        if let Some(shared) = self.0.upgrade() {
            shared.emit(&event);
        }
    }
}

/// Handle of a running transport. Dropping it closes the transport.
pub struct Transport {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Start the worker thread, which connects right away.
    pub fn start(connector: impl Connector, config: TransportConfig) -> io::Result<Self> {
        let shared = Arc::new(Shared::new());
        let worker = Worker {
            shared: Arc::clone(&shared),
            connector: Box::new(connector),
            config,
        };
        let handle = thread::Builder::new()
            .name("eltako-bus".to_string())
            .spawn(move || worker.run())?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Queue a telegram for sending. Best effort: telegrams queued when the link
    /// fails are dropped and reported as [`Diagnostic::SendDropped`].
    pub fn send(&self, telegram: Telegram) {
        if self.is_closed() {
            warn!("Transport closed, not sending {}", telegram);
            return;
        }
        lock(&self.shared.outbox).push_back(telegram);
        self.shared.wakeup.notify_all();
    }

    /// Call `listener` with every telegram received.
    pub fn subscribe(&self, listener: impl FnMut(&Telegram) + Send + 'static) {
        lock(&self.shared.telegram_listeners).push(Box::new(listener));
    }

    pub fn subscribe_events(&self, listener: impl FnMut(&Event) + Send + 'static) {
        lock(&self.shared.event_listeners).push(Box::new(listener));
    }

    pub fn subscribe_diagnostics(&self, listener: impl FnMut(&Diagnostic) + Send + 'static) {
        lock(&self.shared.diagnostic_listeners).push(Box::new(listener));
    }

    /// Register interest in the next telegram for which `matches` returns true.
    ///
    /// Register before sending the request the telegram answers. Each received
    /// telegram goes to the oldest matching expectation only.
    pub fn expect(&self, matches: impl Fn(&Telegram) -> bool + Send + 'static) -> Expectation {
        let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.waiters).push(Waiter {
            id,
            matches: Box::new(matches),
            tx,
        });
        Expectation {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn event_sink(&self) -> EventSink {
        EventSink(Arc::downgrade(&self.shared))
    }

    /// Stop the worker and wait for it to finish. Queued telegrams are discarded.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let _outbox = lock(&self.shared.outbox);
            self.shared.wakeup.notify_all();
        }
        if let Some(handle) = lock(&self.worker).take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Transport worker panicked");
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
