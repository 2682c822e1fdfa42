//! ==============================================================================
//! flexion_link - leader/follower link layer
//! ==============================================================================
//!
//! a leader node samples a joint-flexion angle and streams it to a follower
//! over one of three interchangeable transports. every transport implements
//! the same two traits from link.rs, so the control loops in session.rs never
//! know which medium they run on.
//!
//! layout:
//!     - link.rs: LeaderLink / FollowerLink contract, LinkState, wire codec
//!     - hal.rs: primitive traits for each medium, clocks, addresses
//!     - sim.rs: in-memory media implementing the hal traits
//!     - backends/: wireless, radio and wired implementations
//!     - session.rs: atomic session cells, reconnection policy, loops
//!     - monitor.rs: periodic angle feed for the plotting tool
//!     - config.rs: node.toml schema and loader
//!     - error.rs: HalError / LinkError
//!
//! ==============================================================================

pub mod backends;
pub mod config;
pub mod error;
pub mod hal;
pub mod link;
pub mod monitor;
pub mod session;
pub mod sim;

pub use config::{NodeConfig, Transport};
pub use error::{HalError, LinkError};
pub use link::{decode_measurement, encode_measurement, FollowerLink, LeaderLink, LinkState};
pub use monitor::AngleMonitor;
pub use session::{
    FollowerSession, FollowerSnapshot, GestureEvent, LeaderSession, LeaderTick, ReconnectPolicy,
};
