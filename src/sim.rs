//! ==============================================================================
//! sim.rs - in-memory media (MOCK IMPLEMENTATION)
//! ==============================================================================
//!
//! purpose:
//! ```text
//!     lets a leader and a follower run in one process without radios or a
//!     bus. each medium is a cheap `Clone` handle around shared state; the
//!     node-side endpoints implement the traits from hal.rs.
//!
//!     - SimAether: one advertiser/server and one scanner/client.
//!     - SimAir: datagram radios keyed by mac address.
//!     - SimBus: one controller, peripherals keyed by 7-bit address.
//! ```
//!
//! callbacks are always invoked after the medium lock is released, exactly
//! as a radio stack calls into user code from its own context. the test
//! hooks (drop_connection, inject_advertisement, set_link_up, set_online)
//! stand in for the physical events the real media would produce.
//!
//! ==============================================================================

use crate::error::HalError;
use crate::hal::{
    Advertisement, BusController, BusPeripheral, CharacteristicProperties, Clock, DatagramRadio,
    EventCallback, GattClient, GattServer, MacAddress, NotifyCallback, ReceiveHandler, RecvCallback,
    RequestHandler, ScanAction, ScanCallback, ScanParams, SendCallback, SendStatus, ServerCallbacks,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ==============================================================================
// wireless: advertiser / scanner
// ==============================================================================

struct ServerSlot {
    address: MacAddress,
    name: Option<String>,
    callbacks: Option<ServerCallbacks>,
    service: Option<(Uuid, Uuid, CharacteristicProperties)>,
    value: Vec<u8>,
    advertising: bool,
    connected: bool,
}

#[derive(Default)]
struct AetherState {
    server: Option<ServerSlot>,
    scanner: Option<ScanCallback>,
    scanning: bool,
    scan_params: Option<ScanParams>,
    scans_started: u32,
    client_disconnect: Option<EventCallback>,
    subscriber: Option<NotifyCallback>,
    connect_attempts: u32,
    refuse_connections: bool,
    advertising_started_at: Vec<u64>,
    notifications: u32,
}

impl AetherState {
    fn advertisement(&self) -> Option<Advertisement> {
        let server = self.server.as_ref()?;
        if !server.advertising {
            return None;
        }
        Some(Advertisement {
            address: server.address,
            name: server.name.clone(),
            service_uuids: server.service.iter().map(|(service, _, _)| *service).collect(),
        })
    }
}

/// Shared airspace for the subscribe/notify medium.
#[derive(Clone)]
pub struct SimAether {
    inner: Arc<Mutex<AetherState>>,
    clock: Arc<dyn Clock>,
}

impl SimAether {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AetherState::default())),
            clock,
        }
    }

    /// Server endpoint at `address`. Only one server exists per aether.
    pub fn server(&self, address: MacAddress) -> SimGattServer {
        self.inner.lock().server = Some(ServerSlot {
            address,
            name: None,
            callbacks: None,
            service: None,
            value: Vec::new(),
            advertising: false,
            connected: false,
        });
        SimGattServer { aether: self.clone() }
    }

    pub fn client(&self) -> SimGattClient {
        SimGattClient {
            aether: self.clone(),
            initialized: false,
        }
    }

    /// Hand `advertisement` to the registered scan callback, whether or not
    /// the scan is still running (results already queued by the stack).
    pub fn inject_advertisement(&self, advertisement: &Advertisement) -> Option<ScanAction> {
        let scanner = self.inner.lock().scanner.clone()?;
        let action = scanner(advertisement);
        if action == ScanAction::Stop {
            self.inner.lock().scanning = false;
        }
        Some(action)
    }

    /// Tear down the live connection, firing both sides' disconnect edges.
    pub fn drop_connection(&self) {
        let (server_cb, client_cb) = {
            let mut state = self.inner.lock();
            let client_cb = state.client_disconnect.take();
            state.subscriber = None;
            let server_cb = match state.server.as_mut() {
                Some(server) if server.connected => {
                    server.connected = false;
                    server.advertising = false;
                    server.callbacks.as_ref().map(|cb| cb.on_disconnect.clone())
                }
                _ => None,
            };
            (server_cb, client_cb)
        };
        if let Some(cb) = server_cb {
            cb();
        }
        if let Some(cb) = client_cb {
            cb();
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.lock().refuse_connections = refuse;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.lock().connect_attempts
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scanning
    }

    pub fn scans_started(&self) -> u32 {
        self.inner.lock().scans_started
    }

    pub fn last_scan_params(&self) -> Option<ScanParams> {
        self.inner.lock().scan_params
    }

    pub fn is_advertising(&self) -> bool {
        self.inner
            .lock()
            .server
            .as_ref()
            .is_some_and(|server| server.advertising)
    }

    /// Clock readings at every advertising (re)start.
    pub fn advertising_started_at(&self) -> Vec<u64> {
        self.inner.lock().advertising_started_at.clone()
    }

    pub fn notifications(&self) -> u32 {
        self.inner.lock().notifications
    }
}

pub struct SimGattServer {
    aether: SimAether,
}

impl SimGattServer {
    fn with_slot<T>(
        &self,
        f: impl FnOnce(&mut ServerSlot) -> Result<T, HalError>,
    ) -> Result<T, HalError> {
        let mut state = self.aether.inner.lock();
        let slot = state.server.as_mut().ok_or(HalError::NotInitialized)?;
        f(slot)
    }
}

impl GattServer for SimGattServer {
    fn init(&mut self, device_name: &str) -> Result<(), HalError> {
        self.with_slot(|slot| {
            slot.name = Some(device_name.to_string());
            Ok(())
        })
    }

    fn set_callbacks(&mut self, callbacks: ServerCallbacks) {
        let _ = self.with_slot(|slot| {
            slot.callbacks = Some(callbacks);
            Ok(())
        });
    }

    fn add_service(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        properties: CharacteristicProperties,
    ) -> Result<(), HalError> {
        self.with_slot(|slot| {
            slot.service = Some((service, characteristic, properties));
            Ok(())
        })
    }

    fn start_advertising(&mut self) -> Result<(), HalError> {
        let now = self.aether.clock.now_ms();
        let delivery = {
            let mut state = self.aether.inner.lock();
            let slot = state.server.as_mut().ok_or(HalError::NotInitialized)?;
            if slot.service.is_none() {
                return Err(HalError::NotInitialized);
            }
            slot.advertising = true;
            state.advertising_started_at.push(now);
            match (state.scanning, state.scanner.clone(), state.advertisement()) {
                (true, Some(scanner), Some(advertisement)) => Some((scanner, advertisement)),
                _ => None,
            }
        };
        if let Some((scanner, advertisement)) = delivery {
            if scanner(&advertisement) == ScanAction::Stop {
                self.aether.inner.lock().scanning = false;
            }
        }
        Ok(())
    }

    fn set_value(&mut self, characteristic: Uuid, value: &[u8]) -> Result<(), HalError> {
        self.with_slot(|slot| match slot.service {
            Some((_, uuid, _)) if uuid == characteristic => {
                slot.value = value.to_vec();
                Ok(())
            }
            _ => Err(HalError::NotFound),
        })
    }

    fn notify(&mut self, characteristic: Uuid) -> Result<(), HalError> {
        let delivery = {
            let mut state = self.aether.inner.lock();
            let slot = state.server.as_ref().ok_or(HalError::NotInitialized)?;
            match slot.service {
                Some((_, uuid, _)) if uuid == characteristic => {}
                _ => return Err(HalError::NotFound),
            }
            let value = slot.value.clone();
            let connected = slot.connected;
            state.notifications += 1;
            match (connected, state.subscriber.clone()) {
                (true, Some(subscriber)) => Some((subscriber, value)),
                _ => None,
            }
        };
        if let Some((subscriber, value)) = delivery {
            subscriber(&value, true);
        }
        Ok(())
    }
}

pub struct SimGattClient {
    aether: SimAether,
    initialized: bool,
}

impl GattClient for SimGattClient {
    fn init(&mut self) -> Result<(), HalError> {
        self.initialized = true;
        Ok(())
    }

    fn start_scan(&mut self, params: ScanParams, on_result: ScanCallback) -> Result<(), HalError> {
        if !self.initialized {
            return Err(HalError::NotInitialized);
        }
        let advertisement = {
            let mut state = self.aether.inner.lock();
            state.scanner = Some(on_result.clone());
            state.scanning = true;
            state.scan_params = Some(params);
            state.scans_started += 1;
            state.advertisement()
        };
        if let Some(advertisement) = advertisement {
            if on_result(&advertisement) == ScanAction::Stop {
                self.aether.inner.lock().scanning = false;
            }
        }
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.aether.inner.lock().scanning = false;
    }

    fn connect(
        &mut self,
        device: &Advertisement,
        on_disconnect: EventCallback,
    ) -> Result<(), HalError> {
        let on_connect = {
            let mut state = self.aether.inner.lock();
            state.connect_attempts += 1;
            let refuse = state.refuse_connections;
            let slot = state.server.as_mut().ok_or(HalError::ConnectFailed)?;
            if refuse || slot.address != device.address || !slot.advertising || slot.connected {
                return Err(HalError::ConnectFailed);
            }
            slot.connected = true;
            slot.advertising = false;
            let on_connect = slot.callbacks.as_ref().map(|cb| cb.on_connect.clone());
            state.client_disconnect = Some(on_disconnect);
            on_connect
        };
        if let Some(cb) = on_connect {
            cb();
        }
        Ok(())
    }

    fn subscribe(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        on_notify: NotifyCallback,
    ) -> Result<(), HalError> {
        let mut state = self.aether.inner.lock();
        let slot = state.server.as_ref().ok_or(HalError::NotConnected)?;
        if !slot.connected {
            return Err(HalError::NotConnected);
        }
        match slot.service {
            Some((s, c, props))
                if s == service
                    && c == characteristic
                    && props.contains(CharacteristicProperties::NOTIFY) => {}
            _ => return Err(HalError::NotFound),
        }
        state.subscriber = Some(on_notify);
        Ok(())
    }
}

// ==============================================================================
// radio: peer-to-peer datagrams
// ==============================================================================

#[derive(Default)]
struct RadioSlot {
    initialized: bool,
    send_cb: Option<SendCallback>,
    recv_cb: Option<RecvCallback>,
    peers: Vec<MacAddress>,
}

struct AirState {
    radios: HashMap<MacAddress, RadioSlot>,
    link_up: bool,
    fail_init: bool,
    frames: Vec<(MacAddress, MacAddress, Vec<u8>)>,
}

/// Shared airspace for the datagram medium.
#[derive(Clone)]
pub struct SimAir {
    inner: Arc<Mutex<AirState>>,
}

impl SimAir {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AirState {
                radios: HashMap::new(),
                link_up: true,
                fail_init: false,
                frames: Vec::new(),
            })),
        }
    }

    pub fn radio(&self, mac: MacAddress) -> SimRadio {
        self.inner.lock().radios.entry(mac).or_default();
        SimRadio {
            air: self.clone(),
            mac,
        }
    }

    /// With the link down every datagram fails locally and nothing arrives.
    pub fn set_link_up(&self, up: bool) {
        self.inner.lock().link_up = up;
    }

    pub fn fail_init(&self, fail: bool) {
        self.inner.lock().fail_init = fail;
    }

    /// Every transmitted datagram as (from, to, payload).
    pub fn frames(&self) -> Vec<(MacAddress, MacAddress, Vec<u8>)> {
        self.inner.lock().frames.clone()
    }

    /// Deliver a datagram from `from` to `to` as if it came off the air.
    pub fn deliver(&self, from: MacAddress, to: MacAddress, payload: &[u8]) {
        let recv = self
            .inner
            .lock()
            .radios
            .get(&to)
            .and_then(|slot| slot.recv_cb.clone());
        if let Some(recv) = recv {
            recv(&from, payload);
        }
    }
}

impl Default for SimAir {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimRadio {
    air: SimAir,
    mac: MacAddress,
}

impl SimRadio {
    fn with_slot<T>(&self, f: impl FnOnce(&mut RadioSlot) -> T) -> T {
        let mut state = self.air.inner.lock();
        f(state.radios.entry(self.mac).or_default())
    }
}

impl DatagramRadio for SimRadio {
    fn init(&mut self) -> Result<(), HalError> {
        if self.air.inner.lock().fail_init {
            return Err(HalError::InitFailed("radio stack refused to start".into()));
        }
        self.with_slot(|slot| slot.initialized = true);
        Ok(())
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn register_send_callback(&mut self, callback: SendCallback) {
        self.with_slot(|slot| slot.send_cb = Some(callback));
    }

    fn register_recv_callback(&mut self, callback: RecvCallback) {
        self.with_slot(|slot| slot.recv_cb = Some(callback));
    }

    fn add_peer(&mut self, peer: MacAddress, _channel: u8, _encrypt: bool) -> Result<(), HalError> {
        self.with_slot(|slot| {
            if !slot.initialized {
                return Err(HalError::NotInitialized);
            }
            if !slot.peers.contains(&peer) {
                slot.peers.push(peer);
            }
            Ok(())
        })
    }

    fn send(&mut self, peer: &MacAddress, data: &[u8]) -> Result<(), HalError> {
        let (send_cb, recv_cb) = {
            let mut state = self.air.inner.lock();
            let link_up = state.link_up;
            let slot = state.radios.get(&self.mac).ok_or(HalError::NotInitialized)?;
            if !slot.initialized {
                return Err(HalError::NotInitialized);
            }
            if !slot.peers.contains(peer) {
                return Err(HalError::UnknownPeer(peer.to_string()));
            }
            let send_cb = slot.send_cb.clone();
            let recv_cb = state
                .radios
                .get(peer)
                .filter(|target| link_up && target.initialized)
                .and_then(|target| target.recv_cb.clone());
            state.frames.push((self.mac, *peer, data.to_vec()));
            (send_cb, recv_cb)
        };

        let status = match recv_cb {
            Some(recv) => {
                recv(&self.mac, data);
                SendStatus::Success
            }
            None => SendStatus::Fail,
        };
        if let Some(cb) = send_cb {
            cb(peer, status);
        }
        Ok(())
    }
}

// ==============================================================================
// bus: controller / peripherals
// ==============================================================================

struct PeripheralSlot {
    on_receive: Option<ReceiveHandler>,
    on_request: Option<RequestHandler>,
    online: bool,
}

#[derive(Default)]
struct BusState {
    peripherals: HashMap<u8, PeripheralSlot>,
    writes: u32,
    requests: u32,
}

/// Shared addressed bus.
#[derive(Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controller(&self) -> SimBusController {
        SimBusController {
            bus: self.clone(),
            begun: false,
        }
    }

    pub fn peripheral(&self) -> SimBusPeripheral {
        SimBusPeripheral {
            bus: self.clone(),
            on_receive: None,
            on_request: None,
        }
    }

    /// Unplug (or replug) the peripheral at `address`.
    pub fn set_online(&self, address: u8, online: bool) {
        if let Some(slot) = self.inner.lock().peripherals.get_mut(&address) {
            slot.online = online;
        }
    }

    /// (write transactions, read-request transactions) seen so far.
    pub fn transactions(&self) -> (u32, u32) {
        let state = self.inner.lock();
        (state.writes, state.requests)
    }
}

pub struct SimBusController {
    bus: SimBus,
    begun: bool,
}

impl BusController for SimBusController {
    fn begin(&mut self) -> Result<(), HalError> {
        self.begun = true;
        Ok(())
    }

    fn write(&mut self, address: u8, data: &[u8]) -> Result<(), HalError> {
        if !self.begun {
            return Err(HalError::NotInitialized);
        }
        let handler = {
            let mut state = self.bus.inner.lock();
            state.writes += 1;
            match state.peripherals.get(&address) {
                Some(slot) if slot.online => slot.on_receive.clone(),
                _ => return Err(HalError::Nack(address)),
            }
        };
        if let Some(handler) = handler {
            handler(data);
        }
        Ok(())
    }

    fn request(&mut self, address: u8, len: usize) -> Result<Vec<u8>, HalError> {
        if !self.begun {
            return Err(HalError::NotInitialized);
        }
        let handler = {
            let mut state = self.bus.inner.lock();
            state.requests += 1;
            match state.peripherals.get(&address) {
                Some(slot) if slot.online => slot.on_request.clone(),
                _ => None,
            }
        };
        let mut reply = handler.map(|handler| handler()).unwrap_or_default();
        reply.truncate(len);
        Ok(reply)
    }
}

pub struct SimBusPeripheral {
    bus: SimBus,
    on_receive: Option<ReceiveHandler>,
    on_request: Option<RequestHandler>,
}

impl BusPeripheral for SimBusPeripheral {
    fn on_receive(&mut self, handler: ReceiveHandler) {
        self.on_receive = Some(handler);
    }

    fn on_request(&mut self, handler: RequestHandler) {
        self.on_request = Some(handler);
    }

    fn begin(&mut self, address: u8, _frequency_hz: u32) -> Result<(), HalError> {
        if address > 0x7F {
            return Err(HalError::InitFailed(format!(
                "0x{address:02X} is not a 7-bit bus address"
            )));
        }
        self.bus.inner.lock().peripherals.insert(
            address,
            PeripheralSlot {
                on_receive: self.on_receive.clone(),
                on_request: self.on_request.clone(),
                online: true,
            },
        );
        Ok(())
    }
}
