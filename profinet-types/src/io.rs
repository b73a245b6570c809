// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! Cyclic IO data value types: the sensor and actuator wire formats and the per-submodule
//! provider/consumer status codes.

use byteorder::{BigEndian, ByteOrder};

use crate::{
    constants::{ACTUATOR_WIRE_LEN, IOXS_BAD, IOXS_GOOD, SENSOR_WIRE_LEN},
    encoding::{Error, EncodingResult},
};

/// Quality code carried in the fifth byte of a sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Quality {
    /// Measurement is trustworthy.
    Good = 0x00,
    /// Measurement is present but suspect.
    Uncertain = 0x40,
    /// Measurement failed.
    Bad = 0x80,
    /// The transducer is not attached.
    NotConnected = 0xC0,
}

impl Quality {
    /// Decode a quality byte.
    pub fn from_wire(value: u8) -> EncodingResult<Quality> {
        match value {
            0x00 => Ok(Quality::Good),
            0x40 => Ok(Quality::Uncertain),
            0x80 => Ok(Quality::Bad),
            0xC0 => Ok(Quality::NotConnected),
            other => Err(Error::field_out_of_range(format!(
                "quality byte {other:#04X} is not a known code"
            ))),
        }
    }

    /// The worse of two qualities. Codes order from Good upward, so worse is the larger byte.
    pub fn worst(self, other: Quality) -> Quality {
        if (self as u8) >= (other as u8) {
            self
        } else {
            other
        }
    }
}

/// IO provider status attached to a submodule's data in the direction its producer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Iops {
    /// Provider data is valid.
    Good = IOXS_GOOD,
    /// Provider data must not be used.
    Bad = IOXS_BAD,
}

impl Iops {
    /// Decode an IOPS byte. Only the data-state bit matters; anything without it set is Bad.
    pub fn from_wire(value: u8) -> Iops {
        if value & IOXS_GOOD != 0 {
            Iops::Good
        } else {
            Iops::Bad
        }
    }
}

/// A decoded sensor value.
///
/// Invariant: `stale` implies `quality != Good`; [`SensorReading::mark_stale`] maintains it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Engineering value as transmitted.
    pub value: f32,
    /// Quality code from the wire.
    pub quality: Quality,
    /// Provider status for the submodule this value arrived in.
    pub iops: Iops,
    /// Monotonic receive timestamp, milliseconds.
    pub timestamp_ms: u64,
    /// Set once the reading has outlived the watchdog window.
    pub stale: bool,
}

impl SensorReading {
    /// Decode the 5-byte wire format: float32 big-endian followed by one quality byte.
    pub fn decode_wire(data: &[u8], iops: u8, timestamp_ms: u64) -> EncodingResult<SensorReading> {
        if data.len() != SENSOR_WIRE_LEN {
            return Err(Error::invalid_length(format!(
                "sensor value is {} bytes, expected {}",
                data.len(),
                SENSOR_WIRE_LEN
            )));
        }
        Ok(SensorReading {
            value: BigEndian::read_f32(&data[0..4]),
            quality: Quality::from_wire(data[4])?,
            iops: Iops::from_wire(iops),
            timestamp_ms,
            stale: false,
        })
    }

    /// Flag the reading as stale, downgrading a Good quality to Uncertain so the invariant
    /// `stale == true => quality != Good` holds.
    pub fn mark_stale(&mut self) {
        self.stale = true;
        if self.quality == Quality::Good {
            self.quality = Quality::Uncertain;
        }
    }

    /// `true` when the value may be used for control decisions.
    pub fn is_usable(&self) -> bool {
        !self.stale && self.iops == Iops::Good && self.quality == Quality::Good
    }
}

/// Command byte of an actuator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ActuatorCommand {
    /// De-energise.
    #[default]
    Off = 0,
    /// Energise.
    On = 1,
    /// Pulse-width modulate at the accompanying duty.
    Pwm = 2,
}

impl ActuatorCommand {
    /// Decode a command byte.
    pub fn from_wire(value: u8) -> EncodingResult<ActuatorCommand> {
        match value {
            0 => Ok(ActuatorCommand::Off),
            1 => Ok(ActuatorCommand::On),
            2 => Ok(ActuatorCommand::Pwm),
            other => Err(Error::field_out_of_range(format!(
                "actuator command {other} is not a known code"
            ))),
        }
    }
}

/// An actuator output as packed on the wire: command, PWM duty, two reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActuatorOutput {
    /// What the actuator should do.
    pub command: ActuatorCommand,
    /// Duty cycle 0-255, meaningful only for [`ActuatorCommand::Pwm`].
    pub pwm_duty: u8,
}

impl ActuatorOutput {
    /// Pack into the 4-byte wire format.
    pub fn to_wire(&self) -> [u8; ACTUATOR_WIRE_LEN] {
        [self.command as u8, self.pwm_duty, 0, 0]
    }

    /// Decode the 4-byte wire format, ignoring the reserved bytes.
    pub fn from_wire(data: &[u8]) -> EncodingResult<ActuatorOutput> {
        if data.len() != ACTUATOR_WIRE_LEN {
            return Err(Error::invalid_length(format!(
                "actuator output is {} bytes, expected {}",
                data.len(),
                ACTUATOR_WIRE_LEN
            )));
        }
        Ok(ActuatorOutput {
            command: ActuatorCommand::from_wire(data[0])?,
            pwm_duty: data[1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_decode() {
        let wire = [0x41, 0xC8, 0x00, 0x00, 0x00]; // 25.0, Good
        let reading = SensorReading::decode_wire(&wire, IOXS_GOOD, 1234).unwrap();
        assert_eq!(reading.value, 25.0);
        assert_eq!(reading.quality, Quality::Good);
        assert_eq!(reading.iops, Iops::Good);
        assert_eq!(reading.timestamp_ms, 1234);
        assert!(!reading.stale);
    }

    #[test]
    fn sensor_decode_rejects_unknown_quality() {
        let wire = [0x00, 0x00, 0x00, 0x00, 0x13];
        assert!(SensorReading::decode_wire(&wire, IOXS_GOOD, 0).is_err());
    }

    #[test]
    fn stale_never_good() {
        let wire = [0x41, 0xC8, 0x00, 0x00, 0x00];
        let mut reading = SensorReading::decode_wire(&wire, IOXS_GOOD, 0).unwrap();
        reading.mark_stale();
        assert!(reading.stale);
        assert_ne!(reading.quality, Quality::Good);
    }

    #[test]
    fn actuator_round_trip() {
        let out = ActuatorOutput {
            command: ActuatorCommand::Pwm,
            pwm_duty: 128,
        };
        let wire = out.to_wire();
        assert_eq!(wire, [2, 128, 0, 0]);
        assert_eq!(ActuatorOutput::from_wire(&wire).unwrap(), out);
    }

    #[test]
    fn quality_worst() {
        assert_eq!(Quality::Good.worst(Quality::Bad), Quality::Bad);
        assert_eq!(Quality::Uncertain.worst(Quality::Good), Quality::Uncertain);
        assert_eq!(
            Quality::NotConnected.worst(Quality::Bad),
            Quality::NotConnected
        );
    }
}
