//! ==============================================================================
//! session.rs - link session state and the per-node control loops
//! ==============================================================================
//!
//! purpose:
//!     - LinkCells: the runtime state a backend owns for the lifetime of one
//!       connection (state, latest measurement, last activity). every field
//!       is a single atomic scalar so hardware callbacks and the loop can both
//!       touch it without locks. no invariant spans two fields.
//!     - ReconnectPolicy: paces liveness probes for caller-driven backends.
//!     - LeaderSession: one leader loop iteration = service edges, probe,
//!       sample, send while streaming.
//!     - FollowerSession: one follower loop iteration = drain link, report.
//!
//! relationships:
//!     - used by: backends/* (LinkCells, StateCell), main.rs (sessions)
//!
//! ==============================================================================

use crate::hal::Clock;
use crate::link::{FollowerLink, LeaderLink, LinkState, MEASUREMENT_LEN};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ==============================================================================
// atomic cells
// ==============================================================================

/// `LinkState` stored in one byte.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub const fn new(state: LinkState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> LinkState {
        LinkState::from_repr(self.0.load(Ordering::Acquire))
    }

    /// Store `state`, returning the previous one.
    pub fn store(&self, state: LinkState) -> LinkState {
        LinkState::from_repr(self.0.swap(state as u8, Ordering::AcqRel))
    }

    /// Move from `from` to `to` only if the cell still holds `from`.
    pub fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(LinkState::Disconnected)
    }
}

/// Session state shared between a backend and the callbacks it registered.
#[derive(Debug, Default)]
pub struct LinkCells {
    state: StateCell,
    value_bits: AtomicU32,
    received: AtomicBool,
    last_activity_ms: AtomicU64,
}

impl LinkCells {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> LinkState {
        self.state.load()
    }

    pub fn set_state(&self, state: LinkState) -> LinkState {
        self.state.store(state)
    }

    pub fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.state.transition(from, to)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Overwrite the latest measurement with raw wire bytes. Kept as bits so
    /// the value reads back exactly as sent.
    pub fn store_raw(&self, bytes: [u8; MEASUREMENT_LEN], now_ms: u64) {
        self.value_bits
            .store(u32::from_ne_bytes(bytes), Ordering::Release);
        self.received.store(true, Ordering::Release);
        self.touch(now_ms);
    }

    pub fn value(&self) -> f32 {
        f32::from_bits(self.value_bits.load(Ordering::Acquire))
    }

    /// Whether any measurement arrived during this session.
    pub fn has_value(&self) -> bool {
        self.received.load(Ordering::Acquire)
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Release);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_activity_ms()))
    }
}

// ==============================================================================
// reconnection policy
// ==============================================================================

/// Pacing for backends whose reconnection is driven by the caller's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub retry_interval: Duration,
}

impl ReconnectPolicy {
    pub const fn new(retry_interval: Duration) -> Self {
        Self { retry_interval }
    }

    /// Probe every tick while connected; while disconnected only once the
    /// retry interval since the last probe has elapsed.
    pub fn should_probe(&self, connected: bool, last_probe_ms: Option<u64>, now_ms: u64) -> bool {
        if connected {
            return true;
        }
        match last_probe_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.retry_interval.as_millis() as u64,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

// ==============================================================================
// leader loop
// ==============================================================================

/// Discrete events from the button classifier, one per loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GestureEvent {
    #[default]
    None,
    ShortPress,
    LongPress,
    TriplePress,
}

/// Where the leader's measurement comes from.
pub trait MeasurementSource {
    fn sample(&mut self) -> f32;
}

impl<F: FnMut() -> f32> MeasurementSource for F {
    fn sample(&mut self) -> f32 {
        self()
    }
}

/// Result of one leader iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeaderTick {
    Sent(f32),
    /// Sampled but not streaming; the link was left untouched.
    Paused(f32),
    /// Sampled but no live link.
    Offline(f32),
}

pub struct LeaderSession<L, M> {
    link: L,
    source: M,
    clock: Arc<dyn Clock>,
    policy: ReconnectPolicy,
    streaming: bool,
    connected: bool,
    last_probe_ms: Option<u64>,
    sent: u64,
}

impl<L: LeaderLink, M: MeasurementSource> LeaderSession<L, M> {
    pub fn new(link: L, source: M, clock: Arc<dyn Clock>, policy: ReconnectPolicy) -> Self {
        Self {
            link,
            source,
            clock,
            policy,
            streaming: false,
            connected: false,
            last_probe_ms: None,
            sent: 0,
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Short press toggles streaming. Long and triple presses belong to
    /// collaborators outside the link layer.
    pub fn handle_gesture(&mut self, event: GestureEvent) {
        match event {
            GestureEvent::ShortPress => {
                self.streaming = !self.streaming;
                info!(streaming = self.streaming, "streaming toggled");
            }
            GestureEvent::LongPress | GestureEvent::TriplePress => {
                debug!(?event, "gesture ignored by link session");
            }
            GestureEvent::None => {}
        }
    }

    /// One iteration. Liveness is only probed while streaming: a probe can put
    /// traffic on the medium (the radio hello lands in the follower's value
    /// slot), so a paused leader stays silent.
    pub fn tick(&mut self) -> LeaderTick {
        self.link.poll();

        let value = self.source.sample();
        if !self.streaming {
            return LeaderTick::Paused(value);
        }

        let now = self.clock.now_ms();
        if self.policy.should_probe(self.connected, self.last_probe_ms, now) {
            let up = self.link.is_connected();
            self.last_probe_ms = Some(now);
            if up != self.connected {
                info!(
                    transport = self.link.transport(),
                    connected = up,
                    state = %self.link.state(),
                    "leader link edge"
                );
            }
            self.connected = up;
        }

        if !self.connected {
            return LeaderTick::Offline(value);
        }
        self.link.send(value);
        self.sent += 1;
        LeaderTick::Sent(value)
    }
}

// ==============================================================================
// follower loop
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FollowerSnapshot {
    pub state: LinkState,
    pub connected: bool,
    pub value: f32,
}

pub struct FollowerSession<F> {
    link: F,
    connected: bool,
}

impl<F: FollowerLink> FollowerSession<F> {
    pub fn new(link: F) -> Self {
        Self { link, connected: false }
    }

    pub fn link(&self) -> &F {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut F {
        &mut self.link
    }

    pub fn tick(&mut self) -> FollowerSnapshot {
        self.link.update();
        let connected = self.link.is_connected();
        if connected != self.connected {
            info!(
                transport = self.link.transport(),
                connected,
                state = %self.link.state(),
                "follower link edge"
            );
            self.connected = connected;
        }
        FollowerSnapshot {
            state: self.link.state(),
            connected,
            value: self.link.value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::hal::ManualClock;

    /// Leader whose liveness is scripted by the test.
    #[derive(Default)]
    struct ScriptedLeader {
        up: bool,
        probes: u32,
        polls: u32,
        sent: Vec<f32>,
    }

    impl LeaderLink for ScriptedLeader {
        fn init(&mut self) -> Result<(), LinkError> {
            Ok(())
        }

        fn is_connected(&mut self) -> bool {
            self.probes += 1;
            self.up
        }

        fn send(&mut self, value: f32) {
            self.sent.push(value);
        }

        fn poll(&mut self) {
            self.polls += 1;
        }

        fn state(&self) -> LinkState {
            if self.up {
                LinkState::Connected
            } else {
                LinkState::Idle
            }
        }

        fn transport(&self) -> &'static str {
            "scripted"
        }
    }

    fn session(
        clock: &Arc<ManualClock>,
    ) -> LeaderSession<ScriptedLeader, impl FnMut() -> f32> {
        let mut angle = 0.0f32;
        let source = move || {
            angle += 1.0;
            angle
        };
        LeaderSession::new(
            ScriptedLeader::default(),
            source,
            clock.clone(),
            ReconnectPolicy::new(Duration::from_millis(1000)),
        )
    }

    #[test]
    fn test_state_cell_transition_only_from_expected() {
        let cell = StateCell::new(LinkState::Scanning);
        assert!(cell.transition(LinkState::Scanning, LinkState::Connecting));
        assert!(!cell.transition(LinkState::Scanning, LinkState::Connecting));
        assert_eq!(cell.load(), LinkState::Connecting);
    }

    #[test]
    fn test_cells_store_raw_bits() {
        let cells = LinkCells::new();
        assert_eq!(cells.value(), 0.0);
        assert!(!cells.has_value());
        cells.store_raw((-12.5f32).to_ne_bytes(), 40);
        assert_eq!(cells.value(), -12.5);
        assert!(cells.has_value());
        assert_eq!(cells.idle_for(100), Duration::from_millis(60));
    }

    #[test]
    fn test_policy_paces_probes_only_while_disconnected() {
        let policy = ReconnectPolicy::new(Duration::from_millis(1000));
        assert!(policy.should_probe(false, None, 0));
        assert!(!policy.should_probe(false, Some(0), 999));
        assert!(policy.should_probe(false, Some(0), 1000));
        assert!(policy.should_probe(true, Some(0), 1));
    }

    #[test]
    fn test_short_press_toggles_streaming() {
        let clock = Arc::new(ManualClock::new());
        let mut leader = session(&clock);
        assert!(!leader.is_streaming());
        leader.handle_gesture(GestureEvent::ShortPress);
        assert!(leader.is_streaming());
        leader.handle_gesture(GestureEvent::LongPress);
        leader.handle_gesture(GestureEvent::TriplePress);
        assert!(leader.is_streaming());
        leader.handle_gesture(GestureEvent::ShortPress);
        assert!(!leader.is_streaming());
    }

    #[test]
    fn test_leader_sends_only_when_connected_and_streaming() {
        let clock = Arc::new(ManualClock::new());
        let mut leader = session(&clock).with_streaming(true);

        assert_eq!(leader.tick(), LeaderTick::Offline(1.0));

        leader.link_mut().up = true;
        clock.advance(Duration::from_millis(1000));
        assert_eq!(leader.tick(), LeaderTick::Sent(2.0));

        leader.handle_gesture(GestureEvent::ShortPress);
        assert_eq!(leader.tick(), LeaderTick::Paused(3.0));
        assert_eq!(leader.link().sent, vec![2.0]);
        assert_eq!(leader.sent(), 1);
    }

    #[test]
    fn test_paused_leader_does_not_probe() {
        let clock = Arc::new(ManualClock::new());
        let mut leader = session(&clock).with_streaming(true);
        leader.link_mut().up = true;
        assert_eq!(leader.tick(), LeaderTick::Sent(1.0));
        assert_eq!(leader.link().probes, 1);

        leader.handle_gesture(GestureEvent::ShortPress);
        for _ in 0..3 {
            clock.advance(Duration::from_millis(1000));
            leader.tick();
        }
        assert_eq!(leader.link().probes, 1);
        assert_eq!(leader.link().polls, 4);

        leader.handle_gesture(GestureEvent::ShortPress);
        assert_eq!(leader.tick(), LeaderTick::Sent(5.0));
        assert_eq!(leader.link().probes, 2);
    }

    #[test]
    fn test_leader_retries_on_interval_while_down() {
        let clock = Arc::new(ManualClock::new());
        let mut leader = session(&clock).with_streaming(true);

        leader.tick();
        clock.advance(Duration::from_millis(400));
        leader.tick();
        assert_eq!(leader.link().probes, 1);
        assert_eq!(leader.link().polls, 2);

        clock.advance(Duration::from_millis(600));
        leader.tick();
        assert_eq!(leader.link().probes, 2);
    }
}
