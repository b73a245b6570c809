// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! ARBlockReq and its response counterpart.

use std::io::{Read, Write};

use bitflags::bitflags;

use super::{BlockHeader, BlockType};
use crate::{constants::MAX_STATION_NAME_LEN, encoding::*, uuid::PnUuid};

/// ARType for a single IO controller AR.
pub const AR_TYPE_IOCAR_SINGLE: u16 = 0x0001;

bitflags! {
    /// ARProperties bit field.
    ///
    /// The device-access bit sits at bit position 4. Encoding it at bit 1 produces an AR the
    /// device accepts but never schedules IO for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArProperties: u32 {
        /// AR becomes active immediately after connect.
        const STATE_ACTIVE = 0x0000_0001;
        /// A supervisor may take over this AR.
        const SUPERVISOR_TAKEOVER_ALLOWED = 0x0000_0008;
        /// Device-access AR carrying no cyclic IO.
        const DEVICE_ACCESS = 0x0000_0010;
        /// Companion AR flag, second bit.
        const COMPANION_AR = 0x0000_0060;
        /// Advanced startup mode.
        const STARTUP_MODE_ADVANCED = 0x4000_0000;
    }
}

/// The ARBlockReq opening every Connect request.
#[derive(Debug, Clone, PartialEq)]
pub struct ArBlockReq {
    /// AR flavour, normally [`AR_TYPE_IOCAR_SINGLE`].
    pub ar_type: u16,
    /// The AR UUID generated once per Connect.
    pub ar_uuid: PnUuid,
    /// Session key, echoed by the device in control blocks.
    pub session_key: u16,
    /// MAC of the initiating controller.
    pub cm_initiator_mac: [u8; 6],
    /// Object UUID the initiator answers RPC on.
    pub cm_initiator_object_uuid: PnUuid,
    /// AR property bits.
    pub ar_properties: ArProperties,
    /// Activity timeout in 100 ms units.
    pub cm_initiator_activity_timeout_factor: u16,
    /// UDP port the initiator answers RPC on.
    pub cm_initiator_udp_rt_port: u16,
    /// Station name of the initiator.
    pub cm_initiator_station_name: String,
}

impl BinaryEncodable for ArBlockReq {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + 2 + 16 + 2 + 6 + 16 + 4 + 2 + 2 + 2
            + self.cm_initiator_station_name.len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let name = self.cm_initiator_station_name.as_bytes();
        if name.is_empty() || name.len() > MAX_STATION_NAME_LEN {
            return Err(Error::field_out_of_range(format!(
                "station name is {} bytes, must be 1..={}",
                name.len(),
                MAX_STATION_NAME_LEN
            )));
        }
        let body_len = self.byte_len() - super::BLOCK_HEADER_LEN;
        BlockHeader::new(BlockType::ArBlockReq, body_len).encode(stream)?;
        write_u16(stream, self.ar_type)?;
        self.ar_uuid.encode(stream)?;
        write_u16(stream, self.session_key)?;
        process_encode_io_result(stream.write_all(&self.cm_initiator_mac))?;
        self.cm_initiator_object_uuid.encode(stream)?;
        write_u32(stream, self.ar_properties.bits())?;
        write_u16(stream, self.cm_initiator_activity_timeout_factor)?;
        write_u16(stream, self.cm_initiator_udp_rt_port)?;
        write_u16(stream, name.len() as u16)?;
        process_encode_io_result(stream.write_all(name))
    }
}

impl BinaryDecodable for ArBlockReq {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::ArBlockReq)?;
        let ar_type = read_u16(stream)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let session_key = read_u16(stream)?;
        let mut cm_initiator_mac = [0u8; 6];
        read_bytes(stream, &mut cm_initiator_mac)?;
        let cm_initiator_object_uuid = PnUuid::decode(stream)?;
        let ar_properties = ArProperties::from_bits_retain(read_u32(stream)?);
        let cm_initiator_activity_timeout_factor = read_u16(stream)?;
        let cm_initiator_udp_rt_port = read_u16(stream)?;
        let name_len = read_u16(stream)? as usize;
        if name_len == 0 || name_len > MAX_STATION_NAME_LEN {
            return Err(Error::field_out_of_range(format!(
                "station name length {name_len} must be 1..={MAX_STATION_NAME_LEN}"
            )));
        }
        let mut name = vec![0u8; name_len];
        read_bytes(stream, &mut name)?;
        let cm_initiator_station_name = String::from_utf8(name)
            .map_err(|e| Error::field_out_of_range(format!("station name is not UTF-8: {e}")))?;
        Ok(ArBlockReq {
            ar_type,
            ar_uuid,
            session_key,
            cm_initiator_mac,
            cm_initiator_object_uuid,
            ar_properties,
            cm_initiator_activity_timeout_factor,
            cm_initiator_udp_rt_port,
            cm_initiator_station_name,
        })
    }
}

/// The ARBlockRes returned by the device on a successful Connect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArBlockRes {
    /// AR flavour echoed back.
    pub ar_type: u16,
    /// AR UUID echoed back.
    pub ar_uuid: PnUuid,
    /// Session key echoed back.
    pub session_key: u16,
    /// MAC the device sources cyclic frames from.
    pub cm_responder_mac: [u8; 6],
    /// UDP port the device answers AR-scoped RPC on.
    pub cm_responder_udp_rt_port: u16,
}

impl BinaryDecodable for ArBlockRes {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::ArBlockRes)?;
        let ar_type = read_u16(stream)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let session_key = read_u16(stream)?;
        let mut cm_responder_mac = [0u8; 6];
        read_bytes(stream, &mut cm_responder_mac)?;
        let cm_responder_udp_rt_port = read_u16(stream)?;
        Ok(ArBlockRes {
            ar_type,
            ar_uuid,
            session_key,
            cm_responder_mac,
            cm_responder_udp_rt_port,
        })
    }
}

impl BinaryEncodable for ArBlockRes {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + 2 + 16 + 2 + 6 + 2
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let body_len = self.byte_len() - super::BLOCK_HEADER_LEN;
        BlockHeader::new(BlockType::ArBlockRes, body_len).encode(stream)?;
        write_u16(stream, self.ar_type)?;
        self.ar_uuid.encode(stream)?;
        write_u16(stream, self.session_key)?;
        process_encode_io_result(stream.write_all(&self.cm_responder_mac))?;
        write_u16(stream, self.cm_responder_udp_rt_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_req() -> ArBlockReq {
        ArBlockReq {
            ar_type: AR_TYPE_IOCAR_SINGLE,
            ar_uuid: PnUuid::from_bytes([7; 16]),
            session_key: 1,
            cm_initiator_mac: [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC],
            cm_initiator_object_uuid: PnUuid::from_bytes([9; 16]),
            ar_properties: ArProperties::STATE_ACTIVE | ArProperties::STARTUP_MODE_ADVANCED,
            cm_initiator_activity_timeout_factor: 600,
            cm_initiator_udp_rt_port: 0x8892,
            cm_initiator_station_name: "wtc-controller".to_string(),
        }
    }

    #[test]
    fn ar_block_round_trip() {
        let req = sample_req();
        let bytes = req.encode_to_vec();
        assert_eq!(bytes.len(), req.byte_len());
        let decoded = ArBlockReq::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
        // And byte-identical re-encode.
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn device_access_is_bit_four() {
        assert_eq!(ArProperties::DEVICE_ACCESS.bits(), 0x10);
    }

    #[test]
    fn empty_station_name_rejected() {
        let mut req = sample_req();
        req.cm_initiator_station_name = String::new();
        assert!(req.encode(&mut Vec::new()).is_err());
    }
}
