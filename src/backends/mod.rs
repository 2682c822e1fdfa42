//! ==============================================================================
//! backends - the three Link Contract implementations
//! ==============================================================================
//!
//! each backend is generic over the hal primitive it drives, so the same code
//! runs against real peripherals and against the in-memory media in sim.rs.
//!
//! ```text
//!     transport   leader                  follower
//!     ─────────   ──────────────────────  ─────────────────────────
//!     wireless    WirelessLeader<GattServer>  WirelessFollower<GattClient>
//!     radio       RadioLeader<DatagramRadio>  RadioFollower<DatagramRadio>
//!     wired       WiredLeader<BusController>  WiredFollower<BusPeripheral>
//! ```
//!
//! ==============================================================================

pub mod radio;
pub mod wired;
pub mod wireless;

pub use radio::{PeerTable, RadioFollower, RadioLeader};
pub use wired::{WiredFollower, WiredLeader};
pub use wireless::{WirelessFollower, WirelessLeader};

use crate::config::{NodeConfig, Transport};
use crate::hal::{Clock, MacAddress};
use crate::link::{FollowerLink, LeaderLink};
use crate::sim::{SimAether, SimAir, SimBus};
use std::sync::Arc;

/// Address the simulated wireless leader advertises from.
pub const SIM_SERVER_ADDRESS: MacAddress = MacAddress::new([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]);

/// Leader and follower for the configured transport, joined by a fresh
/// simulated medium. Neither side is initialized yet.
pub fn simulated_pair(
    config: &NodeConfig,
    clock: Arc<dyn Clock>,
) -> (Box<dyn LeaderLink>, Box<dyn FollowerLink>) {
    match config.transport {
        Transport::Wireless => {
            let aether = SimAether::new(clock.clone());
            let leader = WirelessLeader::new(
                aether.server(SIM_SERVER_ADDRESS),
                config.wireless.clone(),
                clock.clone(),
            );
            let follower = WirelessFollower::new(aether.client(), config.wireless.clone(), clock);
            (Box::new(leader), Box::new(follower))
        }
        Transport::Radio => {
            let air = SimAir::new();
            let [leader_mac, follower_mac] = config.radio.peers;
            let leader = RadioLeader::new(air.radio(leader_mac), config.radio.clone());
            let follower = RadioFollower::new(air.radio(follower_mac), config.radio.clone(), clock);
            (Box::new(leader), Box::new(follower))
        }
        Transport::Wired => {
            let bus = SimBus::new();
            let leader = WiredLeader::new(bus.controller(), config.wired.clone());
            let follower = WiredFollower::new(bus.peripheral(), config.wired.clone(), clock);
            (Box::new(leader), Box::new(follower))
        }
    }
}
