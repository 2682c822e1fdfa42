//! ==============================================================================
//! radio.rs - connectionless datagram backend
//! ==============================================================================
//!
//! the medium has no handshake, so "connected" is inferred:
//!     - leader: every datagram's local completion status is recorded by the
//!       send callback. `is_connected` answers from the recorded status and
//!       then queues a LEADER_HELLO probe whose completion informs the next
//!       call. this only proves the radio accepted and transmitted the frame,
//!       never that the follower application saw it.
//!     - follower: every datagram overwrites the measurement slot. until the
//!       follower is marked connected it also checks for LEADER_HELLO. a
//!       measurement whose bytes equal the sentinel also counts as a hello.
//!
//! topology is static: each node finds itself among the two configured
//! addresses and targets the other one.
//!
//! ==============================================================================

use crate::config::RadioConfig;
use crate::error::LinkError;
use crate::hal::{Clock, DatagramRadio, MacAddress, RecvCallback, SendCallback, SendStatus};
use crate::link::{encode_measurement, leading_bytes, FollowerLink, LeaderLink, LinkState, LEADER_HELLO};
use crate::session::LinkCells;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const TRANSPORT: &str = "radio";

/// The two nodes of a static radio deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTable {
    pub first: MacAddress,
    pub second: MacAddress,
}

impl PeerTable {
    pub const fn new(first: MacAddress, second: MacAddress) -> Self {
        Self { first, second }
    }

    pub fn contains(&self, address: MacAddress) -> bool {
        address == self.first || address == self.second
    }

    /// The address that is not `own`. An unlisted `own` gets `first`.
    pub fn peer_of(&self, own: MacAddress) -> MacAddress {
        if own == self.first {
            self.second
        } else {
            self.first
        }
    }
}

// ==============================================================================
// leader
// ==============================================================================

/// Written by the send callback, read by the loop.
#[derive(Debug, Default)]
struct LeaderShared {
    cells: LinkCells,
    last_send_ok: AtomicBool,
}

pub struct RadioLeader<R> {
    radio: R,
    config: RadioConfig,
    shared: Arc<LeaderShared>,
    peer: Option<MacAddress>,
}

impl<R: DatagramRadio> RadioLeader<R> {
    pub fn new(radio: R, config: RadioConfig) -> Self {
        Self {
            radio,
            config,
            shared: Arc::new(LeaderShared::default()),
            peer: None,
        }
    }

    pub fn peer(&self) -> Option<MacAddress> {
        self.peer
    }

    fn on_data_sent(&self) -> SendCallback {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |mac: &MacAddress, status: SendStatus| {
            let ok = status == SendStatus::Success;
            shared.last_send_ok.store(ok, Ordering::Release);
            if ok {
                shared.cells.set_state(LinkState::Connected);
            } else {
                shared
                    .cells
                    .transition(LinkState::Connected, LinkState::Disconnected);
            }
            debug!(peer = %mac, ?status, "send status");
        })
    }

    fn transmit(&mut self, payload: &[u8]) {
        let Some(peer) = self.peer else {
            warn!("send called before init");
            return;
        };
        if let Err(e) = self.radio.send(&peer, payload) {
            // the completion callback will not fire for a refused frame
            self.shared.last_send_ok.store(false, Ordering::Release);
            warn!(peer = %peer, error = %e, "datagram refused");
        }
    }
}

impl<R: DatagramRadio> LeaderLink for RadioLeader<R> {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.peer.is_some() {
            return Ok(());
        }
        self.radio.init()?;
        let on_sent = self.on_data_sent();
        self.radio.register_send_callback(on_sent);

        let own = self.radio.mac_address();
        let peers = PeerTable::new(self.config.peers[0], self.config.peers[1]);
        if !peers.contains(own) {
            warn!(
                own = %own,
                first = %peers.first,
                second = %peers.second,
                "own address is not in the peer table, targeting the first entry"
            );
        }
        let peer = peers.peer_of(own);
        self.radio
            .add_peer(peer, self.config.channel, self.config.encrypt)?;

        self.peer = Some(peer);
        self.shared.cells.set_state(LinkState::Idle);
        info!(own = %own, peer = %peer, "radio leader ready");
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        if self.peer.is_none() {
            return false;
        }
        let recorded = self.shared.last_send_ok.load(Ordering::Acquire);
        let cells = &self.shared.cells;
        if !cells.transition(LinkState::Idle, LinkState::Connecting) {
            cells.transition(LinkState::Disconnected, LinkState::Connecting);
        }
        self.transmit(&LEADER_HELLO);
        recorded
    }

    fn send(&mut self, value: f32) {
        let payload = encode_measurement(value);
        self.transmit(&payload);
        debug!(value, payload = %hex::encode(payload), "datagram queued");
    }

    fn state(&self) -> LinkState {
        self.shared.cells.state()
    }

    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}

// ==============================================================================
// follower
// ==============================================================================

pub struct RadioFollower<R> {
    radio: R,
    config: RadioConfig,
    clock: Arc<dyn Clock>,
    cells: Arc<LinkCells>,
    initialized: bool,
}

impl<R: DatagramRadio> RadioFollower<R> {
    pub fn new(radio: R, config: RadioConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            radio,
            config,
            clock,
            cells: LinkCells::new(),
            initialized: false,
        }
    }

    fn on_data_recv(&self) -> RecvCallback {
        let cells = Arc::clone(&self.cells);
        let clock = Arc::clone(&self.clock);
        Arc::new(move |mac: &MacAddress, data: &[u8]| {
            let Some(bytes) = leading_bytes(data) else {
                debug!(sender = %mac, len = data.len(), "short datagram ignored");
                return;
            };
            cells.store_raw(bytes, clock.now_ms());
            if !cells.is_connected() && bytes == LEADER_HELLO {
                info!(sender = %mac, "received leader hello");
                cells.set_state(LinkState::Connected);
            }
            debug!(sender = %mac, payload = %hex::encode(data), "datagram received");
        })
    }
}

impl<R: DatagramRadio> FollowerLink for RadioFollower<R> {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.initialized {
            return Ok(());
        }
        self.radio.init()?;
        let on_recv = self.on_data_recv();
        self.radio.register_recv_callback(on_recv);
        self.initialized = true;
        self.cells.set_state(LinkState::Idle);
        info!(own = %self.radio.mac_address(), "radio follower listening");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.cells.is_connected()
    }

    fn update(&mut self) {
        if !self.initialized {
            warn!("update called before init");
            return;
        }
        let Some(timeout) = self.config.liveness_timeout() else {
            return;
        };
        if self.cells.is_connected() && self.cells.idle_for(self.clock.now_ms()) >= timeout {
            if self
                .cells
                .transition(LinkState::Connected, LinkState::Disconnected)
            {
                info!(?timeout, "leader silent, waiting for a new hello");
            }
        }
    }

    fn value(&self) -> f32 {
        self.cells.value()
    }

    fn state(&self) -> LinkState {
        self.cells.state()
    }

    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}
