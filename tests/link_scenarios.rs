//! End-to-end runs of both control loops over every simulated medium.

use flexion_link::backends::{simulated_pair, WiredFollower, WiredLeader};
use flexion_link::config::WiredConfig;
use flexion_link::hal::{BusController, Clock, ManualClock};
use flexion_link::sim::SimBus;
use flexion_link::{
    decode_measurement, encode_measurement, FollowerLink, FollowerSession, LeaderLink,
    LeaderSession, LeaderTick, LinkState, NodeConfig, ReconnectPolicy, Transport,
};
use std::sync::Arc;

const ANGLE: f32 = 30.5;

fn stream_fixed_angle(transport: Transport) -> (u32, f32) {
    let config = NodeConfig {
        transport,
        ..NodeConfig::default()
    };
    let clock = Arc::new(ManualClock::new());
    let (mut leader, mut follower) = simulated_pair(&config, clock.clone());
    leader.init().unwrap();
    follower.init().unwrap();

    let mut leader = LeaderSession::new(
        leader,
        || ANGLE,
        clock.clone(),
        ReconnectPolicy::new(config.session.retry_interval()),
    )
    .with_streaming(true);
    let mut follower = FollowerSession::new(follower);

    for tick in 1..=5 {
        follower.tick();
        let sent = matches!(leader.tick(), LeaderTick::Sent(_));
        let snapshot = follower.tick();
        if sent && snapshot.connected && snapshot.value == ANGLE {
            return (tick, snapshot.value);
        }
        clock.advance(config.session.retry_interval());
    }
    panic!("{transport} never delivered the angle");
}

#[test]
fn wireless_delivers_streamed_angle() {
    let (ticks, value) = stream_fixed_angle(Transport::Wireless);
    assert_eq!(value, ANGLE);
    assert_eq!(ticks, 1);
}

#[test]
fn radio_delivers_streamed_angle_after_one_probe() {
    let (ticks, value) = stream_fixed_angle(Transport::Radio);
    assert_eq!(value, ANGLE);
    // the first probe only learns its own completion
    assert_eq!(ticks, 2);
}

#[test]
fn wired_delivers_streamed_angle() {
    let (ticks, value) = stream_fixed_angle(Transport::Wired);
    assert_eq!(value, ANGLE);
    assert_eq!(ticks, 1);
}

#[test]
fn measurement_bits_survive_the_wire() {
    let bus = SimBus::new();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let mut leader = WiredLeader::new(bus.controller(), WiredConfig::default());
    let mut follower = WiredFollower::new(bus.peripheral(), WiredConfig::default(), clock);
    follower.init().unwrap();
    leader.init().unwrap();

    let values = [
        0.0f32,
        -0.0,
        30.5,
        -179.99,
        f32::MIN_POSITIVE,
        f32::MAX,
        f32::INFINITY,
        f32::from_bits(0x7FC0_0001),
    ];
    for value in values {
        assert_eq!(
            decode_measurement(&encode_measurement(value)).map(f32::to_bits),
            Some(value.to_bits())
        );
        leader.send(value);
        follower.update();
        assert_eq!(follower.value().to_bits(), value.to_bits());
    }
}

#[test]
fn wired_liveness_requires_acknowledgment_byte() {
    /// Peripheral stand-in that answers reads with whatever the test wants.
    struct Replies(Vec<Vec<u8>>);

    impl BusController for Replies {
        fn begin(&mut self) -> Result<(), flexion_link::HalError> {
            Ok(())
        }

        fn write(&mut self, _address: u8, _data: &[u8]) -> Result<(), flexion_link::HalError> {
            Ok(())
        }

        fn request(&mut self, _address: u8, _len: usize) -> Result<Vec<u8>, flexion_link::HalError> {
            Ok(self.0.pop().unwrap_or_default())
        }
    }

    let replies = vec![vec![], vec![0x00], vec![0x06], vec![0x06, 0x00]];
    let mut leader = WiredLeader::new(Replies(replies), WiredConfig::default());
    leader.init().unwrap();

    assert!(leader.is_connected());
    assert_eq!(leader.state(), LinkState::Connected);
    assert!(leader.is_connected());
    assert!(!leader.is_connected());
    assert!(!leader.is_connected());
    assert_eq!(leader.state(), LinkState::Disconnected);
}

/// Streams until one value lands, pauses, and returns (last sent, what the
/// follower holds after several paused ticks).
fn pause_after_first_delivery(transport: Transport) -> (f32, f32) {
    let config = NodeConfig {
        transport,
        ..NodeConfig::default()
    };
    let clock = Arc::new(ManualClock::new());
    let (mut leader, mut follower) = simulated_pair(&config, clock.clone());
    leader.init().unwrap();
    follower.init().unwrap();

    let mut angle = 10.0f32;
    let mut leader = LeaderSession::new(
        leader,
        move || {
            angle += 10.0;
            angle
        },
        clock.clone(),
        ReconnectPolicy::new(config.session.retry_interval()),
    )
    .with_streaming(true);
    let mut follower = FollowerSession::new(follower);

    let mut last_sent = None;
    for _ in 0..5 {
        follower.tick();
        if let LeaderTick::Sent(value) = leader.tick() {
            last_sent = Some(value);
            break;
        }
        clock.advance(config.session.retry_interval());
    }
    let last_sent = last_sent.unwrap_or_else(|| panic!("{transport} never streamed"));

    leader.handle_gesture(flexion_link::GestureEvent::ShortPress);
    for _ in 0..3 {
        clock.advance(config.session.retry_interval());
        assert!(matches!(leader.tick(), LeaderTick::Paused(_)));
    }
    let snapshot = follower.tick();
    assert!(snapshot.connected);
    (last_sent, snapshot.value)
}

#[test]
fn paused_leader_keeps_follower_value() {
    for transport in [Transport::Wireless, Transport::Radio, Transport::Wired] {
        let (sent, held) = pause_after_first_delivery(transport);
        assert_eq!(held.to_bits(), sent.to_bits(), "{transport}");
    }
}

#[test]
fn paused_radio_leader_sends_no_hello() {
    let (sent, held) = pause_after_first_delivery(Transport::Radio);
    assert_eq!(sent, 30.0);
    assert_ne!(encode_measurement(held), flexion_link::link::LEADER_HELLO);
}
