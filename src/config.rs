//! ==============================================================================
//! config.rs - node configuration loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `node.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - transport: which backend both nodes run (selected once at startup).
//!     - WirelessConfig: advertised identity, scan parameters, pacing.
//!     - RadioConfig: the static two-node peer table.
//!     - WiredConfig: follower bus address and acknowledgment byte.
//!     - SessionConfig / MonitorConfig / LoggingConfig: loop pacing and output.
//!
//! every section is optional; a missing section or key takes the value the
//! shipped `config/node.toml` carries.
//!
//! ==============================================================================

use crate::hal::MacAddress;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::{uuid, Uuid};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub transport: Transport,
    pub wireless: WirelessConfig,
    pub radio: RadioConfig,
    pub wired: WiredConfig,
    pub session: SessionConfig,
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Wireless,
    Radio,
    Wired,
}

impl Transport {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Transport::Wireless => "wireless",
            Transport::Radio => "radio",
            Transport::Wired => "wired",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WirelessConfig {
    /// Advertised name, at most 4 characters.
    pub device_name: String,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    /// Pause between a disconnect and re-advertising.
    pub settle_delay_ms: u64,
    /// Minimum spacing between notifications.
    pub send_interval_ms: u64,
    pub scan_duration_secs: u64,
    /// Scan interval and window in stack units.
    pub scan_interval: u16,
    pub scan_window: u16,
    pub active_scan: bool,
    pub advertise_while_connected: bool,
}

impl WirelessConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            device_name: "RSD".to_string(),
            service_uuid: uuid!("84527472-275e-4eea-8886-48b86d769be0"),
            characteristic_uuid: uuid!("2580e777-78f4-4ec6-9a33-574382957c28"),
            settle_delay_ms: 500,
            send_interval_ms: 3000,
            scan_duration_secs: 5,
            scan_interval: 1349,
            scan_window: 449,
            active_scan: true,
            advertise_while_connected: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RadioConfig {
    /// Both nodes of the deployment; each node targets the one it is not.
    pub peers: [MacAddress; 2],
    pub channel: u8,
    pub encrypt: bool,
    /// Follower drops back to disconnected after this much silence.
    pub liveness_timeout_ms: Option<u64>,
}

impl RadioConfig {
    pub fn liveness_timeout(&self) -> Option<Duration> {
        self.liveness_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            peers: [
                MacAddress::new([0xC0, 0x49, 0xEF, 0xD4, 0x4F, 0x04]),
                MacAddress::new([0xC0, 0x49, 0xEF, 0xD3, 0x48, 0xDC]),
            ],
            channel: 0,
            encrypt: false,
            liveness_timeout_ms: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WiredConfig {
    pub follower_address: u8,
    pub ack_byte: u8,
    pub frequency_hz: u32,
}

impl Default for WiredConfig {
    fn default() -> Self {
        Self {
            follower_address: 0x43,
            ack_byte: 0x06,
            frequency_hz: 100_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_interval_ms: u64,
    /// Probe pacing while the link is down (radio and wired).
    pub retry_interval_ms: u64,
    pub stream_on_start: bool,
}

impl SessionConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            retry_interval_ms: 1000,
            stream_on_start: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub period_ms: u64,
}

impl MonitorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load and validate configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: NodeConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("node.toml"),
            PathBuf::from("..").join("config").join("node.toml"),
        ];

        // runs before the subscriber exists, so report on stdout directly
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: {:#}", e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Reject values no backend can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let name = &self.wireless.device_name;
        if name.is_empty() || name.chars().count() > 4 {
            bail!("wireless.device_name must be 1 to 4 characters, got {:?}", name);
        }
        if self.wireless.scan_duration_secs == 0 {
            bail!("wireless.scan_duration_secs must be non-zero");
        }
        if self.wireless.scan_window > self.wireless.scan_interval {
            bail!(
                "wireless.scan_window ({}) exceeds scan_interval ({})",
                self.wireless.scan_window,
                self.wireless.scan_interval
            );
        }
        if self.radio.peers[0] == self.radio.peers[1] {
            bail!("radio.peers must name two different nodes");
        }
        if self.wired.follower_address > 0x7F {
            bail!(
                "wired.follower_address 0x{:02X} is not a 7-bit address",
                self.wired.follower_address
            );
        }
        if self.session.sample_interval_ms == 0 {
            bail!("session.sample_interval_ms must be non-zero");
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           NODE CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Transport: {:<29}│", self.transport);
        match self.transport {
            Transport::Wireless => {
                println!("│ Device: {:<32}│", self.wireless.device_name);
                println!("│ Notify every: {:<26}│", format!("{}ms", self.wireless.send_interval_ms));
            }
            Transport::Radio => {
                println!("│ Peer A: {:<32}│", self.radio.peers[0].to_string());
                println!("│ Peer B: {:<32}│", self.radio.peers[1].to_string());
            }
            Transport::Wired => {
                println!(
                    "│ Follower: {:<30}│",
                    format!("0x{:02X} @ {}Hz", self.wired.follower_address, self.wired.frequency_hz)
                );
            }
        }
        println!("│ Sample Interval: {:<23}│", format!("{}ms", self.session.sample_interval_ms));
        println!("│ Log Level: {:<29}│", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
