//! ==============================================================================
//! wireless.rs - subscribe/notify backend
//! ==============================================================================
//!
//! leader (advertiser / server):
//!     exposes one read+notify+indicate characteristic under the configured
//!     service and advertises it. server callbacks only flip the session
//!     state; `poll` turns those edges into actions:
//!     - connect edge: optionally keep advertising.
//!     - disconnect edge: wait the settle delay, then advertise again. the
//!       advertising subsystem needs a quiescent period after teardown.
//!     every notify is followed by the inter-send throttle so the stack's
//!     transmit queue does not congest.
//!
//! follower (scanner / client):
//!     Disconnected -> Scanning -> Connecting -> Connected -> Disconnected.
//!     the scan callback claims the first matching advertisement (Scanning ->
//!     Connecting, stop scan); `update` performs the connect + subscribe and
//!     re-enters scanning after any loss or an expired scan window.
//!
//! ==============================================================================

use crate::config::WirelessConfig;
use crate::error::LinkError;
use crate::hal::{
    Advertisement, CharacteristicProperties, Clock, EventCallback, GattClient, GattServer,
    NotifyCallback, ScanAction, ScanCallback, ScanParams, ServerCallbacks,
};
use crate::link::{encode_measurement, leading_bytes, FollowerLink, LeaderLink, LinkState};
use crate::session::LinkCells;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Advertising names longer than this do not fit the advertising packet.
pub const MAX_DEVICE_NAME_LEN: usize = 4;

const TRANSPORT: &str = "wireless";

// ==============================================================================
// leader
// ==============================================================================

pub struct WirelessLeader<S> {
    server: S,
    config: WirelessConfig,
    clock: Arc<dyn Clock>,
    cells: Arc<LinkCells>,
    /// Set by the disconnect callback, cleared by `poll`.
    dropped: Arc<AtomicBool>,
    initialized: bool,
    was_connected: bool,
}

impl<S: GattServer> WirelessLeader<S> {
    pub fn new(server: S, config: WirelessConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            server,
            config,
            clock,
            cells: LinkCells::new(),
            dropped: Arc::new(AtomicBool::new(false)),
            initialized: false,
            was_connected: false,
        }
    }

    /// Trampolines forwarding server edges into this instance's cells.
    fn server_callbacks(&self) -> ServerCallbacks {
        let on_connect = Arc::clone(&self.cells);
        let on_disconnect = Arc::clone(&self.cells);
        let dropped = Arc::clone(&self.dropped);
        ServerCallbacks {
            on_connect: Arc::new(move || {
                on_connect.set_state(LinkState::Connected);
            }),
            on_disconnect: Arc::new(move || {
                on_disconnect.set_state(LinkState::Disconnected);
                dropped.store(true, Ordering::Release);
            }),
        }
    }
}

impl<S: GattServer> LeaderLink for WirelessLeader<S> {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.initialized {
            return Ok(());
        }
        if self.config.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(LinkError::Config(format!(
                "device name '{}' is longer than {} bytes",
                self.config.device_name, MAX_DEVICE_NAME_LEN
            )));
        }

        self.server.init(&self.config.device_name)?;
        let callbacks = self.server_callbacks();
        self.server.set_callbacks(callbacks);
        self.server.add_service(
            self.config.service_uuid,
            self.config.characteristic_uuid,
            CharacteristicProperties::READ
                | CharacteristicProperties::NOTIFY
                | CharacteristicProperties::INDICATE,
        )?;
        self.server.start_advertising()?;

        // a follower may already have connected while advertising started
        self.cells.transition(LinkState::Disconnected, LinkState::Idle);
        self.initialized = true;
        info!(service = %self.config.service_uuid, "advertising, waiting for a follower");
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.cells.is_connected()
    }

    fn poll(&mut self) {
        if !self.initialized {
            return;
        }
        // a connection that came and went between two polls leaves only the flag
        let dropped = self.dropped.swap(false, Ordering::AcqRel);
        let connected = self.cells.is_connected();

        if connected && (!self.was_connected || dropped) {
            self.was_connected = true;
            info!("follower connected");
            if self.config.advertise_while_connected {
                if let Err(e) = self.server.start_advertising() {
                    warn!(error = %e, "could not keep advertising while connected");
                }
            }
        }

        if !connected && (self.was_connected || dropped) {
            self.clock.delay(self.config.settle_delay());
            match self.server.start_advertising() {
                Ok(()) => {
                    // a connect may have raced in during the settle delay
                    self.cells
                        .transition(LinkState::Disconnected, LinkState::Idle);
                    info!("disconnection detected, advertising again");
                }
                Err(e) => warn!(error = %e, "could not restart advertising"),
            }
            self.was_connected = false;
        }
    }

    fn send(&mut self, value: f32) {
        if !self.initialized {
            warn!("send called before init");
            return;
        }
        if !self.cells.is_connected() {
            return;
        }
        let payload = encode_measurement(value);
        let characteristic = self.config.characteristic_uuid;
        let result = self
            .server
            .set_value(characteristic, &payload)
            .and_then(|()| self.server.notify(characteristic));
        match result {
            Ok(()) => debug!(value, payload = %hex::encode(payload), "notified"),
            Err(e) => warn!(error = %e, "notify failed"),
        }
        self.clock.delay(self.config.send_interval());
    }

    fn state(&self) -> LinkState {
        self.cells.state()
    }

    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}

// ==============================================================================
// follower
// ==============================================================================

/// State touched by the scan, notify and disconnect callbacks.
struct FollowerShared {
    cells: LinkCells,
    /// Leader claimed by the scan callback, waiting for `update` to connect.
    pending: Mutex<Option<Advertisement>>,
    clock: Arc<dyn Clock>,
}

pub struct WirelessFollower<C> {
    client: C,
    config: WirelessConfig,
    shared: Arc<FollowerShared>,
    initialized: bool,
    scan_started_ms: u64,
}

impl<C: GattClient> WirelessFollower<C> {
    pub fn new(client: C, config: WirelessConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            config,
            shared: Arc::new(FollowerShared {
                cells: LinkCells::default(),
                pending: Mutex::new(None),
                clock,
            }),
            initialized: false,
            scan_started_ms: 0,
        }
    }

    fn scan_params(&self) -> ScanParams {
        ScanParams {
            duration: self.config.scan_duration(),
            interval: self.config.scan_interval,
            window: self.config.scan_window,
            active: self.config.active_scan,
        }
    }

    fn on_scan_result(&self) -> ScanCallback {
        let shared = Arc::clone(&self.shared);
        let service = self.config.service_uuid;
        Arc::new(move |advertisement: &Advertisement| {
            debug!(address = %advertisement.address, name = ?advertisement.name, "advertisement");
            if !advertisement.advertises(&service) {
                return ScanAction::Continue;
            }
            // only the first match claims the connect attempt
            if !shared
                .cells
                .transition(LinkState::Scanning, LinkState::Connecting)
            {
                return ScanAction::Stop;
            }
            info!(address = %advertisement.address, "found leader");
            *shared.pending.lock() = Some(advertisement.clone());
            ScanAction::Stop
        })
    }

    fn on_notify(&self) -> NotifyCallback {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |data: &[u8], is_notify: bool| match leading_bytes(data) {
            Some(bytes) => {
                shared.cells.store_raw(bytes, shared.clock.now_ms());
                debug!(payload = %hex::encode(data), is_notify, "measurement received");
            }
            None => debug!(len = data.len(), "short notification ignored"),
        })
    }

    fn on_disconnect(&self) -> EventCallback {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            shared.cells.set_state(LinkState::Disconnected);
        })
    }

    fn start_scan(&mut self) {
        // scanning first so a result delivered during start_scan can claim it
        self.shared.cells.set_state(LinkState::Scanning);
        self.scan_started_ms = self.shared.clock.now_ms();
        let params = self.scan_params();
        let on_result = self.on_scan_result();
        if let Err(e) = self.client.start_scan(params, on_result) {
            warn!(error = %e, "scan failed to start");
            self.shared
                .cells
                .transition(LinkState::Scanning, LinkState::Disconnected);
        }
    }

    fn connect(&mut self) {
        let Some(device) = self.shared.pending.lock().take() else {
            self.shared.cells.set_state(LinkState::Disconnected);
            return;
        };
        self.client.stop_scan();

        let on_disconnect = self.on_disconnect();
        let on_notify = self.on_notify();
        let result = self.client.connect(&device, on_disconnect).and_then(|()| {
            self.client.subscribe(
                self.config.service_uuid,
                self.config.characteristic_uuid,
                on_notify,
            )
        });

        match result {
            Ok(()) => {
                // the disconnect callback may already have fired
                if self
                    .shared
                    .cells
                    .transition(LinkState::Connecting, LinkState::Connected)
                {
                    self.shared.cells.touch(self.shared.clock.now_ms());
                    info!(address = %device.address, "connected to leader");
                }
            }
            Err(e) => {
                warn!(address = %device.address, error = %e, "connect failed");
                self.shared.cells.set_state(LinkState::Disconnected);
            }
        }
    }
}

impl<C: GattClient> FollowerLink for WirelessFollower<C> {
    fn init(&mut self) -> Result<(), LinkError> {
        if self.initialized {
            return Ok(());
        }
        self.client.init()?;
        self.initialized = true;
        self.start_scan();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.cells.is_connected()
    }

    fn update(&mut self) {
        if !self.initialized {
            warn!("update called before init");
            return;
        }
        match self.shared.cells.state() {
            LinkState::Connecting => self.connect(),
            LinkState::Disconnected | LinkState::Idle => {
                info!("scanning for leader");
                self.start_scan();
            }
            LinkState::Scanning => {
                let elapsed = self
                    .shared
                    .clock
                    .now_ms()
                    .saturating_sub(self.scan_started_ms);
                if elapsed >= self.config.scan_duration().as_millis() as u64 {
                    debug!("scan window expired without a match");
                    self.client.stop_scan();
                    self.start_scan();
                }
            }
            LinkState::Connected => {}
        }
    }

    fn value(&self) -> f32 {
        self.shared.cells.value()
    }

    fn state(&self) -> LinkState {
        self.shared.cells.state()
    }

    fn transport(&self) -> &'static str {
        TRANSPORT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{MacAddress, ManualClock};
    use crate::sim::{SimAether, SimGattClient, SimGattServer};
    use std::time::Duration;

    const LEADER_ADDR: MacAddress = MacAddress::new([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01]);

    struct Rig {
        clock: Arc<ManualClock>,
        aether: SimAether,
        leader: WirelessLeader<SimGattServer>,
        follower: WirelessFollower<SimGattClient>,
    }

    fn rig() -> Rig {
        let clock = Arc::new(ManualClock::new());
        let aether = SimAether::new(clock.clone());
        let config = WirelessConfig::default();
        let leader = WirelessLeader::new(aether.server(LEADER_ADDR), config.clone(), clock.clone());
        let follower = WirelessFollower::new(aether.client(), config, clock.clone());
        Rig {
            clock,
            aether,
            leader,
            follower,
        }
    }

    fn connected_rig() -> Rig {
        let mut rig = rig();
        rig.leader.init().unwrap();
        rig.follower.init().unwrap();
        rig.follower.update();
        rig.leader.poll();
        assert!(rig.follower.is_connected());
        assert!(rig.leader.is_connected());
        rig
    }

    #[test]
    fn test_leader_init_advertises() {
        let mut rig = rig();
        assert_eq!(rig.leader.state(), LinkState::Disconnected);
        rig.leader.init().unwrap();
        assert_eq!(rig.leader.state(), LinkState::Idle);
        assert!(rig.aether.is_advertising());
    }

    #[test]
    fn test_leader_rejects_long_device_name() {
        let clock = Arc::new(ManualClock::new());
        let aether = SimAether::new(clock.clone());
        let config = WirelessConfig {
            device_name: "TOO-LONG".into(),
            ..WirelessConfig::default()
        };
        let mut leader = WirelessLeader::new(aether.server(LEADER_ADDR), config, clock);
        assert!(matches!(leader.init(), Err(LinkError::Config(_))));
        assert!(!aether.is_advertising());
    }

    #[test]
    fn test_follower_scan_uses_configured_window() {
        let mut rig = rig();
        rig.follower.init().unwrap();
        let params = rig.aether.last_scan_params().unwrap();
        assert_eq!(params.duration, Duration::from_secs(5));
        assert_eq!((params.interval, params.window), (1349, 449));
        assert!(params.active);
    }

    #[test]
    fn test_match_stops_scan_and_claims_one_attempt() {
        let mut rig = rig();
        rig.follower.init().unwrap();
        assert_eq!(rig.follower.state(), LinkState::Scanning);

        rig.leader.init().unwrap();
        assert_eq!(rig.follower.state(), LinkState::Connecting);
        assert!(!rig.aether.is_scanning());

        // late duplicates of the same advertisement
        let advertisement = Advertisement {
            address: LEADER_ADDR,
            name: Some("RSD".into()),
            service_uuids: vec![WirelessConfig::default().service_uuid],
        };
        rig.aether.inject_advertisement(&advertisement);
        rig.aether.inject_advertisement(&advertisement);

        rig.follower.update();
        rig.follower.update();
        assert_eq!(rig.aether.connect_attempts(), 1);
        assert_eq!(rig.follower.state(), LinkState::Connected);
    }

    #[test]
    fn test_foreign_advertisement_keeps_scanning() {
        let mut rig = rig();
        rig.follower.init().unwrap();
        let stranger = Advertisement {
            address: MacAddress::new([1, 2, 3, 4, 5, 6]),
            name: Some("tv".into()),
            service_uuids: vec![uuid::Uuid::nil()],
        };
        assert_eq!(
            rig.aether.inject_advertisement(&stranger),
            Some(ScanAction::Continue)
        );
        assert_eq!(rig.follower.state(), LinkState::Scanning);
        assert!(rig.aether.is_scanning());
    }

    #[test]
    fn test_notify_delivers_value_and_throttles() {
        let mut rig = connected_rig();
        let before = rig.clock.now_ms();
        rig.leader.send(30.5);
        assert_eq!(rig.follower.value(), 30.5);
        assert_eq!(rig.clock.now_ms() - before, 3000);
    }

    #[test]
    fn test_send_while_disconnected_is_dropped() {
        let mut rig = rig();
        rig.leader.init().unwrap();
        rig.leader.send(12.0);
        assert_eq!(rig.aether.notifications(), 0);
        assert_eq!(rig.clock.now_ms(), 0);
    }

    #[test]
    fn test_readvertise_waits_for_settle_delay() {
        let mut rig = connected_rig();
        let starts_before = rig.aether.advertising_started_at().len();

        rig.clock.advance(Duration::from_millis(10_000));
        rig.aether.drop_connection();
        assert_eq!(rig.leader.state(), LinkState::Disconnected);
        assert_eq!(rig.follower.state(), LinkState::Disconnected);
        assert!(!rig.aether.is_advertising());

        rig.leader.poll();
        let starts = rig.aether.advertising_started_at();
        assert_eq!(starts.len(), starts_before + 1);
        assert_eq!(*starts.last().unwrap(), 10_500);
        assert_eq!(rig.leader.state(), LinkState::Idle);
    }

    #[test]
    fn test_follower_rescans_and_reconnects() {
        let mut rig = connected_rig();
        rig.aether.drop_connection();
        rig.leader.poll();

        rig.follower.update();
        assert_eq!(rig.follower.state(), LinkState::Connecting);
        rig.follower.update();
        assert_eq!(rig.follower.state(), LinkState::Connected);
        assert_eq!(rig.aether.connect_attempts(), 2);

        rig.leader.poll();
        rig.leader.send(-7.25);
        assert_eq!(rig.follower.value(), -7.25);
    }

    #[test]
    fn test_connection_lost_between_polls_still_readvertises() {
        let mut rig = rig();
        rig.leader.init().unwrap();
        rig.follower.init().unwrap();
        rig.follower.update();
        assert!(rig.follower.is_connected());

        // the leader never polls while the connection lives
        rig.aether.drop_connection();
        assert!(!rig.aether.is_advertising());

        rig.leader.poll();
        assert!(rig.aether.is_advertising());
        assert_eq!(*rig.aether.advertising_started_at().last().unwrap(), 500);
        assert_eq!(rig.leader.state(), LinkState::Idle);

        rig.follower.update();
        rig.follower.update();
        assert!(rig.follower.is_connected());
        assert_eq!(rig.aether.connect_attempts(), 2);

        // the recorded drop is consumed: this poll only sees the new connection
        rig.leader.poll();
        assert_eq!(rig.aether.advertising_started_at(), vec![0, 500, 500]);
        assert!(rig.leader.is_connected());
    }

    /// Server whose stack reports a connection while advertising starts.
    #[derive(Default)]
    struct EagerServer {
        callbacks: Option<ServerCallbacks>,
    }

    impl GattServer for EagerServer {
        fn init(&mut self, _device_name: &str) -> Result<(), crate::error::HalError> {
            Ok(())
        }

        fn set_callbacks(&mut self, callbacks: ServerCallbacks) {
            self.callbacks = Some(callbacks);
        }

        fn add_service(
            &mut self,
            _service: uuid::Uuid,
            _characteristic: uuid::Uuid,
            _properties: CharacteristicProperties,
        ) -> Result<(), crate::error::HalError> {
            Ok(())
        }

        fn start_advertising(&mut self) -> Result<(), crate::error::HalError> {
            if let Some(callbacks) = &self.callbacks {
                (callbacks.on_connect)();
            }
            Ok(())
        }

        fn set_value(
            &mut self,
            _characteristic: uuid::Uuid,
            _value: &[u8],
        ) -> Result<(), crate::error::HalError> {
            Ok(())
        }

        fn notify(&mut self, _characteristic: uuid::Uuid) -> Result<(), crate::error::HalError> {
            Ok(())
        }
    }

    #[test]
    fn test_init_keeps_connection_made_during_advertising_start() {
        let clock = Arc::new(ManualClock::new());
        let mut leader =
            WirelessLeader::new(EagerServer::default(), WirelessConfig::default(), clock);
        leader.init().unwrap();
        assert_eq!(leader.state(), LinkState::Connected);
        assert!(leader.is_connected());
    }

    #[test]
    fn test_failed_connect_returns_to_scanning() {
        let mut rig = rig();
        rig.leader.init().unwrap();
        rig.aether.refuse_connections(true);
        rig.follower.init().unwrap();
        rig.follower.update();
        assert_eq!(rig.follower.state(), LinkState::Disconnected);

        rig.aether.refuse_connections(false);
        rig.follower.update();
        rig.follower.update();
        assert!(rig.follower.is_connected());
    }

    #[test]
    fn test_expired_scan_restarts() {
        let clock = Arc::new(ManualClock::new());
        let aether = SimAether::new(clock.clone());
        let mut follower =
            WirelessFollower::new(aether.client(), WirelessConfig::default(), clock.clone());
        follower.init().unwrap();
        assert_eq!(aether.scans_started(), 1);

        clock.advance(Duration::from_secs(4));
        follower.update();
        assert_eq!(aether.scans_started(), 1);

        clock.advance(Duration::from_secs(1));
        follower.update();
        assert_eq!(aether.scans_started(), 2);
        assert_eq!(follower.state(), LinkState::Scanning);
    }
}
