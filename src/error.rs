//! Error types shared by the primitive layer and the link backends.

use thiserror::Error;

/// Failure reported by a transport primitive (radio stack, bus, GATT stack).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HalError {
    #[error("subsystem not initialized")]
    NotInitialized,
    #[error("subsystem failed to start: {0}")]
    InitFailed(String),
    #[error("no acknowledgment from bus address 0x{0:02X}")]
    Nack(u8),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("connection attempt failed")]
    ConnectFailed,
    #[error("remote service or characteristic not found")]
    NotFound,
    #[error("not connected")]
    NotConnected,
    #[error("bus error: {0}")]
    Bus(String),
}

/// Failure surfaced by a link backend. Only `init` returns one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link initialization failed: {0}")]
    Init(#[from] HalError),
    #[error("invalid link configuration: {0}")]
    Config(String),
}
