//! ==============================================================================
//! link.rs - leader / follower link contract
//! ==============================================================================
//!
//! purpose:
//!     the two capability sets every transport backend implements, plus the
//!     4-byte wire codec for the measurement.
//!
//! contract:
//!     - `init` may be retried after a failure; after a success it is a no-op.
//!     - `send` / `update` never block on the peer and must not be called
//!       before a successful `init` (backends log and ignore such calls).
//!     - all state lives inside the backend instance; nothing is shared
//!       between backend types.
//!
//! relationships:
//!     - implemented by: backends/wireless.rs, backends/radio.rs, backends/wired.rs
//!     - driven by: session.rs (LeaderSession / FollowerSession)
//!
//! ==============================================================================

use crate::error::LinkError;

/// Size of the only payload ever exchanged.
pub const MEASUREMENT_LEN: usize = 4;

/// Liveness probe sent by the radio leader. Shares the payload slot with the
/// measurement, so a float with the same bit pattern is indistinguishable.
pub const LEADER_HELLO: [u8; MEASUREMENT_LEN] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Encode a measurement in the node's native byte order.
pub fn encode_measurement(value: f32) -> [u8; MEASUREMENT_LEN] {
    value.to_ne_bytes()
}

/// Decode the leading 4 bytes of a payload. `None` if the payload is short.
pub fn decode_measurement(payload: &[u8]) -> Option<f32> {
    leading_bytes(payload).map(f32::from_ne_bytes)
}

/// The leading 4 bytes of a payload, untouched.
pub fn leading_bytes(payload: &[u8]) -> Option<[u8; MEASUREMENT_LEN]> {
    payload.get(..MEASUREMENT_LEN)?.try_into().ok()
}

/// Connection state of one backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    /// Initialized and waiting (advertising, or ready to probe).
    Idle = 1,
    Scanning = 2,
    Connecting = 3,
    Connected = 4,
}

impl LinkState {
    pub const fn from_repr(raw: u8) -> Self {
        match raw {
            1 => LinkState::Idle,
            2 => LinkState::Scanning,
            3 => LinkState::Connecting,
            4 => LinkState::Connected,
            _ => LinkState::Disconnected,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Idle => "idle",
            LinkState::Scanning => "scanning",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node that produces the measurement.
pub trait LeaderLink: Send {
    /// Bring up the underlying medium.
    fn init(&mut self) -> Result<(), LinkError>;

    /// Liveness as the backend understands it. May emit a probe on the medium,
    /// hence `&mut self`.
    fn is_connected(&mut self) -> bool;

    /// Push the latest measurement to the follower.
    fn send(&mut self, value: f32);

    /// Service connection edges once per loop iteration. Backends with
    /// self-driven reconnection (re-advertising) do their work here.
    fn poll(&mut self) {}

    fn state(&self) -> LinkState;

    /// Short transport name for logs.
    fn transport(&self) -> &'static str;
}

/// Node that receives and exposes the measurement.
pub trait FollowerLink: Send {
    fn init(&mut self) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Non-blocking drain of pending link work.
    fn update(&mut self);

    /// Most recent measurement; 0.0 before the first receipt.
    fn value(&self) -> f32;

    fn state(&self) -> LinkState;

    fn transport(&self) -> &'static str;
}

impl<T: LeaderLink + ?Sized> LeaderLink for Box<T> {
    fn init(&mut self) -> Result<(), LinkError> {
        (**self).init()
    }

    fn is_connected(&mut self) -> bool {
        (**self).is_connected()
    }

    fn send(&mut self, value: f32) {
        (**self).send(value)
    }

    fn poll(&mut self) {
        (**self).poll()
    }

    fn state(&self) -> LinkState {
        (**self).state()
    }

    fn transport(&self) -> &'static str {
        (**self).transport()
    }
}

impl<T: FollowerLink + ?Sized> FollowerLink for Box<T> {
    fn init(&mut self) -> Result<(), LinkError> {
        (**self).init()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn update(&mut self) {
        (**self).update()
    }

    fn value(&self) -> f32 {
        (**self).value()
    }

    fn state(&self) -> LinkState {
        (**self).state()
    }

    fn transport(&self) -> &'static str {
        (**self).transport()
    }
}
