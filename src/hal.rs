//! ==============================================================================
//! hal.rs - transport primitive layer
//! ==============================================================================
//!
//! purpose:
//!     the raw primitives each link backend is written against. one trait per
//!     medium and role, shaped like the vendor stacks they stand in for:
//!     - GattServer / GattClient: connection-oriented wireless with
//!       service discovery and subscribe/notify.
//!     - DatagramRadio: connectionless peer-to-peer datagrams with an
//!       asynchronous send-completion report.
//!     - BusController / BusPeripheral: shared addressed bus with
//!       write and read-request transactions.
//!     - Clock: monotonic milliseconds and the blocking delay used for
//!       deliberate backpressure.
//!
//! callbacks:
//!     every callback is an `Arc<dyn Fn .. + Send + Sync>`. the stack may run
//!     it from an interrupt or radio-service context, so it must only touch
//!     the atomic cells it captured (see session.rs).
//!
//! relationships:
//!     - implemented by: sim.rs (in-memory media), RppalBus below
//!       (feature = "hardware")
//!     - used by: backends/*
//!
//! ==============================================================================

use crate::error::HalError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ==============================================================================
// addressing
// ==============================================================================

/// 6-byte hardware address (radio peer or wireless device address).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("mac address '{s}' has fewer than 6 octets"))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| format!("bad octet '{part}' in mac address '{s}': {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("mac address '{s}' has more than 6 octets"));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(value: MacAddress) -> Self {
        value.to_string()
    }
}

// ==============================================================================
// callback shapes
// ==============================================================================

/// Edge notification with no payload (connect, disconnect).
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Called for every advertisement seen while scanning.
pub type ScanCallback = Arc<dyn Fn(&Advertisement) -> ScanAction + Send + Sync>;

/// Called with the characteristic value on every notification/indication.
/// The flag is `true` for a notify, `false` for an indicate.
pub type NotifyCallback = Arc<dyn Fn(&[u8], bool) + Send + Sync>;

/// Send-completion report for a datagram.
pub type SendCallback = Arc<dyn Fn(&MacAddress, SendStatus) + Send + Sync>;

/// Receipt of one datagram from `sender`.
pub type RecvCallback = Arc<dyn Fn(&MacAddress, &[u8]) + Send + Sync>;

/// Bus peripheral: payload of a controller write.
pub type ReceiveHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Bus peripheral: bytes to answer a controller read-request with.
pub type RequestHandler = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

// ==============================================================================
// connection-oriented wireless (subscribe / notify)
// ==============================================================================

/// GATT characteristic property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One advertising packet as seen by a scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
}

impl Advertisement {
    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.iter().any(|uuid| uuid == service)
    }
}

/// What the scanner should do after a scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    pub duration: Duration,
    /// In 0.625 ms units, as the radio stack expects.
    pub interval: u16,
    pub window: u16,
    pub active: bool,
}

/// Server-side connection edges.
#[derive(Clone)]
pub struct ServerCallbacks {
    pub on_connect: EventCallback,
    pub on_disconnect: EventCallback,
}

/// Advertiser / server role.
pub trait GattServer: Send {
    fn init(&mut self, device_name: &str) -> Result<(), HalError>;

    fn set_callbacks(&mut self, callbacks: ServerCallbacks);

    /// Create and start a service with a single characteristic. A client
    /// configuration descriptor is added when the properties allow
    /// notify or indicate.
    fn add_service(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        properties: CharacteristicProperties,
    ) -> Result<(), HalError>;

    /// Start (or restart) advertising the service.
    fn start_advertising(&mut self) -> Result<(), HalError>;

    fn set_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), HalError>;

    /// Notify subscribed clients with the current value.
    fn notify(&mut self, characteristic: Uuid) -> Result<(), HalError>;
}

/// Scanner / client role.
pub trait GattClient: Send {
    fn init(&mut self) -> Result<(), HalError>;

    /// Start a time-boxed scan. Results arrive on `on_result`; returning
    /// `ScanAction::Stop` ends the scan.
    fn start_scan(&mut self, params: ScanParams, on_result: ScanCallback) -> Result<(), HalError>;

    fn stop_scan(&mut self);

    fn connect(
        &mut self,
        device: &Advertisement,
        on_disconnect: EventCallback,
    ) -> Result<(), HalError>;

    /// Discover `service`/`characteristic` on the connected server and
    /// register for notifications.
    fn subscribe(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        on_notify: NotifyCallback,
    ) -> Result<(), HalError>;
}

// ==============================================================================
// connectionless radio datagrams
// ==============================================================================

/// Local outcome of a datagram. Success means the radio accepted and
/// transmitted it, not that the peer application saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Fail,
}

pub trait DatagramRadio: Send {
    fn init(&mut self) -> Result<(), HalError>;

    /// This node's own hardware address.
    fn mac_address(&self) -> MacAddress;

    fn register_send_callback(&mut self, callback: SendCallback);

    fn register_recv_callback(&mut self, callback: RecvCallback);

    fn add_peer(&mut self, peer: MacAddress, channel: u8, encrypt: bool) -> Result<(), HalError>;

    /// Queue a datagram. The completion status arrives on the send callback.
    fn send(&mut self, peer: &MacAddress, data: &[u8]) -> Result<(), HalError>;
}

// ==============================================================================
// addressed bus
// ==============================================================================

pub trait BusController: Send {
    fn begin(&mut self) -> Result<(), HalError>;

    /// Write transaction addressed to a 7-bit peripheral address.
    fn write(&mut self, address: u8, data: &[u8]) -> Result<(), HalError>;

    /// Read-request transaction. Returns the bytes actually received, which
    /// may be fewer than `len` (zero when nobody answered).
    fn request(&mut self, address: u8, len: usize) -> Result<Vec<u8>, HalError>;
}

pub trait BusPeripheral: Send {
    fn on_receive(&mut self, handler: ReceiveHandler);

    fn on_request(&mut self, handler: RequestHandler);

    /// Join the bus at `address`.
    fn begin(&mut self, address: u8, frequency_hz: u32) -> Result<(), HalError>;
}

// ==============================================================================
// time
// ==============================================================================

pub trait Clock: Send + Sync {
    /// Monotonic milliseconds.
    fn now_ms(&self) -> u64;

    /// Blocking delay. The cooperative loop does nothing else meanwhile.
    fn delay(&self, duration: Duration);
}

/// Wall clock backed by `Instant` and `thread::sleep`.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock; `delay` advances time instead of sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn delay(&self, duration: Duration) {
        self.advance(duration);
    }
}

// ==============================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================

/// Bus controller on the Pi's I2C1 pins.
#[cfg(feature = "hardware")]
pub struct RppalBus {
    i2c: Option<rppal::i2c::I2c>,
}

#[cfg(feature = "hardware")]
impl RppalBus {
    pub fn new() -> Self {
        tracing::info!("Using REAL HARDWARE bus (rppal)");
        Self { i2c: None }
    }

    fn bus(&mut self, address: u8) -> Result<&mut rppal::i2c::I2c, HalError> {
        let i2c = self.i2c.as_mut().ok_or(HalError::NotInitialized)?;
        i2c.set_slave_address(address as u16)
            .map_err(|e| HalError::Bus(e.to_string()))?;
        Ok(i2c)
    }
}

#[cfg(feature = "hardware")]
impl Default for RppalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "hardware")]
impl BusController for RppalBus {
    fn begin(&mut self) -> Result<(), HalError> {
        if self.i2c.is_none() {
            let i2c = rppal::i2c::I2c::new().map_err(|e| HalError::InitFailed(e.to_string()))?;
            self.i2c = Some(i2c);
        }
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<(), HalError> {
        let i2c = self.bus(address)?;
        i2c.write(data).map_err(|_| HalError::Nack(address))?;
        Ok(())
    }

    fn request(&mut self, address: u8, len: usize) -> Result<Vec<u8>, HalError> {
        let i2c = self.bus(address)?;
        let mut read_buf = vec![0u8; len];
        match i2c.read(&mut read_buf) {
            Ok(count) => {
                read_buf.truncate(count);
                Ok(read_buf)
            }
            // a missing peripheral shows up as a NACK on the address byte
            Err(_) => Ok(Vec::new()),
        }
    }
}
