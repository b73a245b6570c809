// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! AlarmCRBlockReq and its response counterpart.

use std::io::{Read, Write};

use super::{BlockHeader, BlockType};
use crate::{
    constants::{PROFINET_ETHERTYPE, RTA_TIMEOUT_FACTOR_MAX},
    encoding::*,
};

/// AlarmCRType for the one alarm CR an AR carries.
const ALARM_CR_TYPE: u16 = 0x0001;

/// The AlarmCRBlockReq describing the acyclic alarm channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmCrBlockReq {
    /// Always 1.
    pub alarm_cr_type: u16,
    /// EtherType of alarm frames, always 0x8892.
    pub lt_field: u16,
    /// Property bits, 0 for RTA class 1.
    pub alarm_cr_properties: u32,
    /// RTA retransmission timeout in 100 ms units. IEC 61158 caps this at 100.
    pub rta_timeout_factor: u16,
    /// RTA retry count.
    pub rta_retries: u16,
    /// Alarm reference of the controller endpoint.
    pub local_alarm_reference: u16,
    /// Largest alarm payload either side may send.
    pub max_alarm_data_length: u16,
    /// VLAN tag for high priority alarms.
    pub alarm_cr_tag_header_high: u16,
    /// VLAN tag for low priority alarms.
    pub alarm_cr_tag_header_low: u16,
}

impl Default for AlarmCrBlockReq {
    fn default() -> Self {
        AlarmCrBlockReq {
            alarm_cr_type: ALARM_CR_TYPE,
            lt_field: PROFINET_ETHERTYPE,
            alarm_cr_properties: 0,
            rta_timeout_factor: 1,
            rta_retries: 3,
            local_alarm_reference: 0x0001,
            max_alarm_data_length: 200,
            alarm_cr_tag_header_high: 0xC000,
            alarm_cr_tag_header_low: 0xA000,
        }
    }
}

impl BinaryEncodable for AlarmCrBlockReq {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + 20
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        if self.rta_timeout_factor > RTA_TIMEOUT_FACTOR_MAX {
            return Err(Error::field_out_of_range(format!(
                "rta_timeout_factor {} exceeds the standard's maximum {RTA_TIMEOUT_FACTOR_MAX}",
                self.rta_timeout_factor
            )));
        }
        BlockHeader::new(BlockType::AlarmCrBlockReq, 20).encode(stream)?;
        write_u16(stream, self.alarm_cr_type)?;
        write_u16(stream, self.lt_field)?;
        write_u32(stream, self.alarm_cr_properties)?;
        write_u16(stream, self.rta_timeout_factor)?;
        write_u16(stream, self.rta_retries)?;
        write_u16(stream, self.local_alarm_reference)?;
        write_u16(stream, self.max_alarm_data_length)?;
        write_u16(stream, self.alarm_cr_tag_header_high)?;
        write_u16(stream, self.alarm_cr_tag_header_low)
    }
}

impl BinaryDecodable for AlarmCrBlockReq {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::AlarmCrBlockReq)?;
        Ok(AlarmCrBlockReq {
            alarm_cr_type: read_u16(stream)?,
            lt_field: read_u16(stream)?,
            alarm_cr_properties: read_u32(stream)?,
            rta_timeout_factor: read_u16(stream)?,
            rta_retries: read_u16(stream)?,
            local_alarm_reference: read_u16(stream)?,
            max_alarm_data_length: read_u16(stream)?,
            alarm_cr_tag_header_high: read_u16(stream)?,
            alarm_cr_tag_header_low: read_u16(stream)?,
        })
    }
}

/// The AlarmCRBlockRes acknowledging the alarm channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmCrBlockRes {
    /// Always 1.
    pub alarm_cr_type: u16,
    /// Alarm reference of the device endpoint.
    pub remote_alarm_reference: u16,
    /// Largest alarm payload the device will send.
    pub max_alarm_data_length: u16,
}

impl BinaryDecodable for AlarmCrBlockRes {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::AlarmCrBlockRes)?;
        Ok(AlarmCrBlockRes {
            alarm_cr_type: read_u16(stream)?,
            remote_alarm_reference: read_u16(stream)?,
            max_alarm_data_length: read_u16(stream)?,
        })
    }
}

impl BinaryEncodable for AlarmCrBlockRes {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + 6
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::AlarmCrBlockRes, 6).encode(stream)?;
        write_u16(stream, self.alarm_cr_type)?;
        write_u16(stream, self.remote_alarm_reference)?;
        write_u16(stream, self.max_alarm_data_length)
    }
}
