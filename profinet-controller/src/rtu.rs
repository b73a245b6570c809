//! The RTU entity, its slot model and health counters.
//!
//! RTU records are owned exclusively by the registry task. Everything handed outward is a
//! point-in-time clone.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use profinet_types::{
    constants::{ACTUATOR_WIRE_LEN, MAX_STATION_NAME_LEN, SENSOR_WIRE_LEN},
    ActuatorOutput, SensorReading,
};

use crate::authority::AuthorityContext;
use crate::session::SessionId;

/// Connection lifecycle of one RTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Known but not enabled.
    Offline,
    /// Enabled, waiting for DCP to observe the station with an address.
    Discovery,
    /// Connect sequence in flight.
    Connecting,
    /// AR established, parameterisation not yet acknowledged.
    Connected,
    /// Cyclic exchange active.
    Running,
    /// Faulted, reconnect pending.
    Error,
    /// Operator-requested release in progress.
    Disconnect,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Offline => "OFFLINE",
            ConnectionState::Discovery => "DISCOVERY",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Running => "RUNNING",
            ConnectionState::Error => "ERROR",
            ConnectionState::Disconnect => "DISCONNECT",
        };
        f.write_str(s)
    }
}

/// What a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// The mandatory slot 0 device access point.
    Dap,
    /// A measurement input.
    Sensor,
    /// A controlled output.
    Actuator,
}

/// Static configuration of one (slot, subslot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Slot number; 0 is always the DAP.
    pub slot: u16,
    /// Subslot number, 1 unless the module splits.
    pub subslot: u16,
    /// What the slot holds.
    pub kind: SlotKind,
    /// Operator-facing name, e.g. "intake turbidity".
    pub name: String,
    /// Engineering unit, e.g. "NTU".
    #[serde(default)]
    pub unit: String,
    /// Measurement or actuator subtype, e.g. "turbidity", "discrete", "dosing-pump".
    #[serde(default)]
    pub subtype: String,
    /// Lower scaling bound in engineering units.
    #[serde(default)]
    pub scale_min: f32,
    /// Upper scaling bound in engineering units.
    #[serde(default)]
    pub scale_max: f32,
    /// Alarm threshold pair (low, high).
    #[serde(default)]
    pub alarm_low: Option<f32>,
    /// High alarm threshold.
    #[serde(default)]
    pub alarm_high: Option<f32>,
    /// Warning threshold pair (low, high).
    #[serde(default)]
    pub warn_low: Option<f32>,
    /// High warning threshold.
    #[serde(default)]
    pub warn_high: Option<f32>,
    /// Historian deadband in engineering units.
    #[serde(default)]
    pub deadband: f32,
    /// Disabled slots are excluded from the AR entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// ModuleIdentNumber expected in this slot.
    #[serde(default)]
    pub module_ident: u32,
    /// SubmoduleIdentNumber expected in this subslot.
    #[serde(default)]
    pub submodule_ident: u32,
}

fn default_true() -> bool {
    true
}

impl SlotConfig {
    /// The mandatory DAP in slot 0, subslot 1.
    pub fn dap(module_ident: u32, submodule_ident: u32) -> SlotConfig {
        SlotConfig {
            slot: 0,
            subslot: 1,
            kind: SlotKind::Dap,
            name: "device access point".to_string(),
            unit: String::new(),
            subtype: String::new(),
            scale_min: 0.0,
            scale_max: 0.0,
            alarm_low: None,
            alarm_high: None,
            warn_low: None,
            warn_high: None,
            deadband: 0.0,
            enabled: true,
            module_ident,
            submodule_ident,
        }
    }

    /// Bytes this slot's IO data occupies on the wire, excluding the status byte.
    pub fn wire_len(&self) -> usize {
        match self.kind {
            SlotKind::Dap => 0,
            SlotKind::Sensor => {
                if self.subtype == "discrete" {
                    1
                } else {
                    SENSOR_WIRE_LEN
                }
            }
            SlotKind::Actuator => ACTUATOR_WIRE_LEN,
        }
    }
}

/// Validate a station name: DNS-label-like, at most 64 bytes, lowercase alphanumerics and
/// hyphens in dot-separated labels, no label starting or ending with a hyphen.
pub fn validate_station_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("station name is empty".to_string());
    }
    if name.len() > MAX_STATION_NAME_LEN {
        return Err(format!(
            "station name is {} bytes, limit is {MAX_STATION_NAME_LEN}",
            name.len()
        ));
    }
    for label in name.split('.') {
        if label.is_empty() {
            return Err(format!("station name {name:?} has an empty label"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label {label:?} starts or ends with a hyphen"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(format!(
                "label {label:?} contains characters outside [a-z0-9-]"
            ));
        }
    }
    Ok(())
}

/// Cycle bookkeeping for one RTU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HealthCounters {
    /// Cycles attempted since connect.
    pub total_cycles: u64,
    /// Cycles with a matching input frame.
    pub good_cycles: u64,
    /// Cycles without one.
    pub failed_cycles: u64,
    /// Times the state machine re-entered CONNECTING after ERROR.
    pub reconnect_count: u32,
}

impl HealthCounters {
    /// Failed cycles as a percentage of all cycles.
    pub fn packet_loss_percent(&self) -> f32 {
        if self.total_cycles == 0 {
            0.0
        } else {
            100.0 * self.failed_cycles as f32 / self.total_cycles as f32
        }
    }
}

/// Runtime state of one actuator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ActuatorState {
    /// Last commanded output.
    #[serde(skip)]
    pub output: ActuatorOutput,
    /// Accumulated energised time.
    pub total_on_ms: u64,
    /// Off-to-on transitions.
    pub cycle_count: u64,
    /// Held by an operator force, ignoring automation.
    pub forced: bool,
    /// When the actuator last went on, for on-time accrual.
    #[serde(skip)]
    pub last_on_ms: Option<u64>,
}

/// One remote terminal unit as the registry tracks it.
#[derive(Debug, Clone)]
pub struct RtuDevice {
    /// Station name, the primary key.
    pub station_name: String,
    /// Address learned from DCP or configured.
    pub ip: Option<Ipv4Addr>,
    /// MAC learned from DCP.
    pub mac: Option<[u8; 6]>,
    /// Vendor identifier.
    pub vendor_id: u16,
    /// Device identifier.
    pub device_id: u16,
    /// Connection lifecycle state.
    pub state: ConnectionState,
    /// When DCP or cyclic traffic last proved the device alive.
    pub last_seen: Option<DateTime<Utc>>,
    /// Ordered slot configuration; index 0 is the DAP.
    pub slots: Vec<SlotConfig>,
    /// Latest sensor readings by (slot, subslot).
    pub readings: HashMap<(u16, u16), SensorReading>,
    /// Actuator states by (slot, subslot).
    pub actuators: HashMap<(u16, u16), ActuatorState>,
    /// Cycle health.
    pub health: HealthCounters,
    /// Who is in control.
    pub authority: AuthorityContext,
    /// Live session handle, when one exists.
    pub session: Option<SessionId>,
    /// Whether the operator wants this RTU connected.
    pub enabled: bool,
}

impl RtuDevice {
    /// A fresh record from configuration.
    pub fn new(
        station_name: String,
        vendor_id: u16,
        device_id: u16,
        slots: Vec<SlotConfig>,
        stale_command_threshold_ms: u64,
    ) -> RtuDevice {
        RtuDevice {
            station_name,
            ip: None,
            mac: None,
            vendor_id,
            device_id,
            state: ConnectionState::Offline,
            last_seen: None,
            slots,
            readings: HashMap::new(),
            actuators: HashMap::new(),
            health: HealthCounters::default(),
            authority: AuthorityContext::new(stale_command_threshold_ms),
            session: None,
            enabled: false,
        }
    }

    /// The slot configuration at (slot, subslot), if any.
    pub fn slot(&self, slot: u16, subslot: u16) -> Option<&SlotConfig> {
        self.slots
            .iter()
            .find(|s| s.slot == slot && s.subslot == subslot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_names() {
        assert!(validate_station_name("wtc-rtu-01").is_ok());
        assert!(validate_station_name("plant.intake.rtu-1").is_ok());
        assert!(validate_station_name("").is_err());
        assert!(validate_station_name("Upper-Case").is_err());
        assert!(validate_station_name("-leading").is_err());
        assert!(validate_station_name("trailing-").is_err());
        assert!(validate_station_name("dot..dot").is_err());
        assert!(validate_station_name(&"x".repeat(65)).is_err());
        assert!(validate_station_name(&"x".repeat(64)).is_ok());
    }

    #[test]
    fn packet_loss() {
        let health = HealthCounters {
            total_cycles: 200,
            good_cycles: 150,
            failed_cycles: 50,
            reconnect_count: 0,
        };
        assert_eq!(health.packet_loss_percent(), 25.0);
        assert_eq!(HealthCounters::default().packet_loss_percent(), 0.0);
    }

    #[test]
    fn wire_lengths() {
        let mut slot = SlotConfig::dap(1, 1);
        assert_eq!(slot.wire_len(), 0);
        slot.kind = SlotKind::Sensor;
        assert_eq!(slot.wire_len(), 5);
        slot.subtype = "discrete".to_string();
        assert_eq!(slot.wire_len(), 1);
        slot.kind = SlotKind::Actuator;
        assert_eq!(slot.wire_len(), 4);
    }
}
