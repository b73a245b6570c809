//! Controller configuration. The host injects a [`ControllerConfig`] struct; the YAML file
//! layer exists for hosts that want one.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::historian::CompressionAlgorithm;
use crate::rtu::{validate_station_name, SlotConfig, SlotKind};

/// Error returned from saving or loading config objects.
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration is invalid, with a list of validation errors.
    ConfigInvalid(Vec<String>),
    /// Reading or writing file failed.
    IO(std::io::Error),
    /// Failed to serialize or deserialize config object.
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ConfigInvalid(errors) => {
                write!(f, "configuration invalid: {}", errors.join("; "))
            }
            ConfigError::IO(e) => write!(f, "configuration io error: {e}"),
            ConfigError::Yaml(e) => write!(f, "configuration yaml error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

/// A trait that handles the loading / saving and validity of configuration information.
pub trait Config: serde::Serialize {
    /// Save the configuration object to a file.
    fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Err(e) = self.validate() {
            return Err(ConfigError::ConfigInvalid(e));
        }
        let s = serde_yaml::to_string(&self)?;
        std::fs::write(path, s)?;
        Ok(())
    }

    /// Load the configuration object from the given path.
    fn load<A>(path: &Path) -> Result<A, ConfigError>
    where
        for<'de> A: Config + serde::Deserialize<'de>,
    {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate the config struct, returning a list of validation errors if it fails.
    fn validate(&self) -> Result<(), Vec<String>>;
}

/// One station the controller should manage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station name, the primary key on the segment.
    pub station_name: String,
    /// Static address to provision when DCP finds the device unconfigured.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,
    /// Netmask used when provisioning.
    #[serde(default)]
    pub netmask: Option<Ipv4Addr>,
    /// Gateway used when provisioning.
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    /// Expected vendor id, 0 to accept any.
    #[serde(default)]
    pub vendor_id: u16,
    /// Expected device id, 0 to accept any.
    #[serde(default)]
    pub device_id: u16,
    /// Historian gate per sensor slot.
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    /// Whether the controller connects at startup.
    #[serde(default)]
    pub enabled: bool,
    /// Slot layout; slot 0 must be the DAP.
    pub slots: Vec<SlotConfig>,
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Interface to bind; auto-detected when absent.
    #[serde(default)]
    pub interface: Option<String>,
    /// Local address RPC sockets bind to; unspecified lets kernel routing choose the real
    /// interface address.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    /// Our own station name, announced in every ARBlockReq.
    #[serde(default = "default_station_name")]
    pub controller_station_name: String,
    /// Cycle time in milliseconds; a power of two between 1 and 512.
    #[serde(default = "default_cycle_time")]
    pub cycle_time_ms: u32,
    /// Watchdog multiplier on the cycle time.
    #[serde(default = "default_watchdog_factor")]
    pub watchdog_factor: u16,
    /// Per-call RPC deadline in milliseconds.
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_ms: u64,
    /// Identify sweep interval in milliseconds.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,
    /// Commands older than this are dropped.
    #[serde(default = "default_stale_threshold")]
    pub stale_command_threshold_ms: u64,
    /// Authority epoch persistence file.
    #[serde(default = "default_authority_file")]
    pub authority_file: PathBuf,
    /// Registry mailbox depth.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Subscriber event channel depth.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// The stations to manage.
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

fn default_station_name() -> String {
    "wtc-controller".to_string()
}
fn default_cycle_time() -> u32 {
    32
}
fn default_watchdog_factor() -> u16 {
    3
}
fn default_rpc_timeout() -> u64 {
    3000
}
fn default_discovery_interval() -> u64 {
    5000
}
fn default_stale_threshold() -> u64 {
    500
}
fn default_authority_file() -> PathBuf {
    PathBuf::from("authority-epochs.bin")
}
fn default_mailbox_capacity() -> usize {
    64
}
fn default_event_capacity() -> usize {
    256
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            interface: None,
            local_ip: None,
            controller_station_name: default_station_name(),
            cycle_time_ms: default_cycle_time(),
            watchdog_factor: default_watchdog_factor(),
            rpc_timeout_ms: default_rpc_timeout(),
            discovery_interval_ms: default_discovery_interval(),
            stale_command_threshold_ms: default_stale_threshold(),
            authority_file: default_authority_file(),
            mailbox_capacity: default_mailbox_capacity(),
            event_capacity: default_event_capacity(),
            stations: Vec::new(),
        }
    }
}

impl Config for ControllerConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if !self.cycle_time_ms.is_power_of_two() || !(1..=512).contains(&self.cycle_time_ms) {
            errors.push(format!(
                "cycle_time_ms {} must be a power of two between 1 and 512",
                self.cycle_time_ms
            ));
        }
        if self.watchdog_factor == 0 {
            errors.push("watchdog_factor must be at least 1".to_string());
        }
        if let Err(e) = validate_station_name(&self.controller_station_name) {
            errors.push(e);
        }
        for station in &self.stations {
            if let Err(e) = validate_station_name(&station.station_name) {
                errors.push(e);
            }
            match station.slots.first() {
                Some(slot) if slot.slot == 0 && slot.kind == SlotKind::Dap => {}
                _ => errors.push(format!(
                    "station {:?}: slot 0 must be the DAP",
                    station.station_name
                )),
            }
            let mut seen = std::collections::BTreeSet::new();
            for slot in &station.slots {
                if !seen.insert((slot.slot, slot.subslot)) {
                    errors.push(format!(
                        "station {:?}: duplicate slot {}.{}",
                        station.station_name, slot.slot, slot.subslot
                    ));
                }
                if slot.deadband < 0.0 {
                    errors.push(format!(
                        "station {:?} slot {}: deadband must not be negative",
                        station.station_name, slot.slot
                    ));
                }
                if let (Some(low), Some(high)) = (slot.alarm_low, slot.alarm_high) {
                    if low >= high {
                        errors.push(format!(
                            "station {:?} slot {}: alarm_low {low} is not below alarm_high {high}",
                            station.station_name, slot.slot
                        ));
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
