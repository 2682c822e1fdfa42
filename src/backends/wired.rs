//! ==============================================================================
//! wired.rs - addressed bus backend
//! ==============================================================================
//!
//! every exchange is a synchronous transaction started by the leader:
//!     - send: one 4-byte write to the follower address.
//!     - is_connected: a 1-byte read request. the follower answers with the
//!       acknowledgment byte; anything else (including an empty read) means
//!       the follower is not there.
//!
//! the follower never initiates anything. it marks itself connected the
//! first time it answers a request and stays connected: a silent bus looks
//! exactly like a leader that has nothing to say.
//!
//! ==============================================================================

use crate::config::WiredConfig;
use crate::error::LinkError;
use crate::hal::{BusController, BusPeripheral, Clock, ReceiveHandler, RequestHandler};
use crate::link::{encode_measurement, leading_bytes, FollowerLink, LeaderLink, LinkState};
use crate::session::LinkCells;
use std::sync::Arc;
use tracing::{debug, info, warn};

const TRANSPORT: &str = "wired";

// ==============================================================================
// leader (bus controller)
// ==============================================================================

pub struct WiredLeader<B> {
    bus: B,
    config: WiredConfig,
    cells: Arc<LinkCells>,
    initialized: bool,
}

impl<B: BusController> WiredLeader<B> {
    pub fn new(bus: B, config: WiredConfig) -> Self {
        Self {
            bus,
            config,
            cells: LinkCells::new(),
            initialized: false,
        }
    }
}

impl<B: BusController> LeaderLink for WiredLeader<B> {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.initialized {
            return Ok(());
        }
        self.bus.begin()?;
        self.initialized = true;
        self.cells.set_state(LinkState::Idle);
        info!(
            follower = format_args!("0x{:02X}", self.config.follower_address),
            "bus controller ready"
        );
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        if !self.cells.is_connected() {
            self.cells.set_state(LinkState::Connecting);
        }
        let acked = match self.bus.request(self.config.follower_address, 1) {
            Ok(reply) => reply.first() == Some(&self.config.ack_byte),
            Err(e) => {
                debug!(error = %e, "liveness request failed");
                false
            }
        };
        let next = if acked {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        if self.cells.set_state(next) != next {
            debug!(state = %next, "bus liveness changed");
        }
        acked
    }

    fn send(&mut self, value: f32) {
        if !self.initialized {
            warn!("send called before init");
            return;
        }
        let payload = encode_measurement(value);
        match self.bus.write(self.config.follower_address, &payload) {
            Ok(()) => debug!(value, payload = %hex::encode(payload), "measurement written"),
            Err(e) => debug!(value, error = %e, "measurement write dropped"),
        }
    }

    fn state(&self) -> LinkState {
        self.cells.state()
    }

    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}

// ==============================================================================
// follower (bus peripheral)
// ==============================================================================

pub struct WiredFollower<P> {
    peripheral: P,
    config: WiredConfig,
    clock: Arc<dyn Clock>,
    cells: Arc<LinkCells>,
    initialized: bool,
}

impl<P: BusPeripheral> WiredFollower<P> {
    pub fn new(peripheral: P, config: WiredConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            peripheral,
            config,
            clock,
            cells: LinkCells::new(),
            initialized: false,
        }
    }

    fn on_receive(&self) -> ReceiveHandler {
        let cells = Arc::clone(&self.cells);
        let clock = Arc::clone(&self.clock);
        Arc::new(move |data: &[u8]| match leading_bytes(data) {
            Some(bytes) => cells.store_raw(bytes, clock.now_ms()),
            None => debug!(len = data.len(), "short bus write ignored"),
        })
    }

    fn on_request(&self) -> RequestHandler {
        let cells = Arc::clone(&self.cells);
        let clock = Arc::clone(&self.clock);
        let ack = self.config.ack_byte;
        Arc::new(move || {
            if cells.set_state(LinkState::Connected) != LinkState::Connected {
                info!("leader probed the bus, connected");
            }
            cells.touch(clock.now_ms());
            vec![ack]
        })
    }
}

impl<P: BusPeripheral> FollowerLink for WiredFollower<P> {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.initialized {
            return Ok(());
        }
        let on_receive = self.on_receive();
        let on_request = self.on_request();
        self.peripheral.on_receive(on_receive);
        self.peripheral.on_request(on_request);
        self.peripheral
            .begin(self.config.follower_address, self.config.frequency_hz)?;
        self.initialized = true;
        self.cells.transition(LinkState::Disconnected, LinkState::Idle);
        info!(
            address = format_args!("0x{:02X}", self.config.follower_address),
            frequency_hz = self.config.frequency_hz,
            "bus peripheral listening"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.cells.is_connected()
    }

    /// Everything arrives through the bus handlers.
    fn update(&mut self) {}

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
