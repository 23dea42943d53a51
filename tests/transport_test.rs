mod common;

use std::time::Duration;

use common::*;
use eltako_bus::eep::{self, Rorg};
use eltako_bus::{
    ConnectionState, Diagnostic, Eep, Event, MalformedReason, RadioId, RadioTelegram, Telegram,
    Transport, TransportConfig,
};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

fn temperature_telegram() -> Telegram {
    let sender = RadioId::new(0x0102_0304);
    Telegram::RadioReceived(RadioTelegram::four_bs(sender, [0x00, 0x00, 0x7f, 0x08], 0x00))
}

fn received(events: Vec<Event>) -> Vec<Telegram> {
    events
        .into_iter()
        .filter_map(|e| match e {
            Event::TelegramReceived(t) => Some(t),
            _ => None,
        })
        .collect()
}

#[test]
fn radio_telegram_is_received_once() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    let events = events(&transport);

    bus.inject(&temperature_telegram());
    let telegrams = received(drain(&events, QUIET));
    assert_eq!(telegrams, vec![temperature_telegram()]);

    let radio = telegrams[0].radio().unwrap();
    let profile = Eep::new(Rorg::FourBs, 0x02, 0x05);
    let t = eep::decode_radio(profile, radio)
        .unwrap()
        .measure("temperature")
        .unwrap();
    assert!((0.0..=40.0).contains(&t));
}

#[test]
fn listeners_see_telegrams_in_order() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    let (tx, rx) = std::sync::mpsc::channel();
    transport.subscribe(move |t| {
        let _ = tx.send(*t);
    });

    let sent: Vec<Telegram> = (1..=5u8)
        .map(|n| Telegram::RadioReceived(RadioTelegram::rps(RadioId::new(n.into()), 0x30, 0x30)))
        .collect();
    let mut bytes = Vec::new();
    for t in &sent {
        bytes.extend_from_slice(&eltako_bus::codec::serialize(t));
    }
    // split across reads at odd offsets
    let (head, tail) = bytes.split_at(17);
    bus.inject_bytes(head);
    bus.inject_bytes(tail);
    assert_eq!(drain(&rx, QUIET), sent);
}

#[test]
fn corrupted_frame_is_reported_and_skipped() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    let events = events(&transport);
    let diagnostics = diagnostics(&transport);

    let mut corrupted = eltako_bus::codec::serialize(&temperature_telegram());
    corrupted[13] ^= 0xff;
    bus.inject_bytes(&[0x00, 0x13, 0xa5]);
    bus.inject_bytes(&corrupted);
    bus.inject(&Telegram::Lock);

    assert_eq!(received(drain(&events, QUIET)), vec![Telegram::Lock]);
    let diagnostics = drain(&diagnostics, QUIET);
    assert_eq!(diagnostics.len(), 1, "{:?}", diagnostics);
    match &diagnostics[0] {
        Diagnostic::Malformed(frame) => assert_eq!(frame.reason, MalformedReason::Checksum),
        d => panic!("unexpected diagnostic {:?}", d),
    }
}

#[test]
fn reconnects_after_read_failure() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    let events = events(&transport);
    let (tx, rx) = std::sync::mpsc::channel();
    transport.subscribe(move |t| {
        let _ = tx.send(*t);
    });

    bus.fail_next_read();
    assert!(wait_for(WAIT, || bus.opens() == 2));
    assert!(wait_for(WAIT, || transport.state() == ConnectionState::Connected));
    let states: Vec<ConnectionState> = drain(&events, QUIET)
        .into_iter()
        .filter_map(|e| match e {
            Event::ConnectionStateChanged(s) => Some(s),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );

    // the same listeners are fed after the reconnect
    bus.inject(&temperature_telegram());
    assert_eq!(drain(&rx, QUIET), vec![temperature_telegram()]);
}

#[test]
fn retries_a_missing_port() {
    init_logger();
    let bus = SimBus::new();
    bus.refuse_opens(3);
    let transport = Transport::start(bus.connector(), transport_config()).unwrap();
    assert!(wait_for(WAIT, || transport.state() == ConnectionState::Connected));
    assert_eq!(bus.opens(), 1);
}

#[test]
fn panicking_listener_is_isolated() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    transport.subscribe(|t| {
        if *t == Telegram::Lock {
            panic!("listener failure");
        }
    });
    let events = events(&transport);
    let diagnostics = diagnostics(&transport);

    bus.inject(&Telegram::Lock);
    bus.inject(&Telegram::Unlock);
    assert_eq!(
        received(drain(&events, QUIET)),
        vec![Telegram::Lock, Telegram::Unlock]
    );
    let diagnostics = drain(&diagnostics, QUIET);
    assert_eq!(
        diagnostics,
        vec![Diagnostic::ListenerPanicked {
            message: "listener failure".to_string()
        }]
    );
    assert_eq!(transport.state(), ConnectionState::Connected);
}

#[test]
fn sends_queued_telegrams() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    transport.send(Telegram::Poll(4));
    transport.send(Telegram::Poll(5));
    assert!(wait_for(WAIT, || bus.written().len() == 2));
    assert_eq!(bus.written(), vec![Telegram::Poll(4), Telegram::Poll(5)]);
}

#[test]
fn sending_is_paced() {
    init_logger();
    let bus = SimBus::new();
    let config = TransportConfig {
        send_delay: Duration::from_millis(20),
        burst_limit: 3,
        burst_pause: Duration::from_millis(80),
        ..transport_config()
    };
    let transport = Transport::start(bus.connector(), config).unwrap();
    assert!(wait_for(WAIT, || transport.state() == ConnectionState::Connected));

    for a in 1..=5 {
        transport.send(Telegram::Poll(a));
    }
    assert!(wait_for(WAIT, || bus.written().len() == 5));
    let gaps: Vec<Duration> = bus
        .written_at()
        .windows(2)
        .map(|w| w[1].duration_since(w[0]))
        .collect();
    assert!(gaps[0] >= Duration::from_millis(20), "{:?}", gaps);
    assert!(gaps[1] >= Duration::from_millis(20), "{:?}", gaps);
    // the fourth telegram starts a new burst
    assert!(gaps[2] >= Duration::from_millis(80), "{:?}", gaps);
    assert!(gaps[3] >= Duration::from_millis(20), "{:?}", gaps);
    assert_eq!(bus.written(), (1..=5).map(Telegram::Poll).collect::<Vec<_>>());
}

#[test]
fn expectation_gets_response() {
    init_logger();
    let bus = SimBus::with_fam();
    bus.add_device(SimDevice::relay(3));
    let transport = connect(&bus);

    let expectation = transport.expect(|t| matches!(t, Telegram::DiscoveryReply(r) if r.address == 3));
    transport.send(Telegram::DiscoveryRequest(3));
    match expectation.wait(WAIT) {
        Some(Telegram::DiscoveryReply(reply)) => assert_eq!(reply.size, 1),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn close_stops_the_worker() {
    init_logger();
    let bus = SimBus::new();
    let transport = connect(&bus);
    transport.close();
    assert!(transport.is_closed());
    assert_eq!(transport.state(), ConnectionState::Disconnected);

    transport.send(Telegram::Poll(1));
    std::thread::sleep(QUIET);
    assert!(bus.written().is_empty());
}
