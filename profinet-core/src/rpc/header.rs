// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The 80-byte DCE/RPC 1.1 connectionless header.
//!
//! Integer fields are little-endian because the controller always stamps DREP 0x10. UUID fields
//! in this header, and only in this header, carry their first three sub-fields little-endian;
//! the swap happens here at the encode/decode boundary so the rest of the stack works in
//! canonical byte order.

use std::io::{Read, Write};

use profinet_types::{
    process_decode_io_result, process_encode_io_result, read_u16_le, read_u32_le, read_u8,
    write_u16_le, write_u32_le, write_u8, BinaryDecodable, BinaryEncodable, EncodingResult,
    Error, PnUuid,
};

/// Exact wire size of the RPC header.
pub const RPC_HEADER_LEN: usize = 80;

/// RPC protocol version for connectionless PDUs.
pub const RPC_VERSION: u8 = 4;

/// Data representation label: little-endian integers, IEEE floats.
pub const DREP_LITTLE_ENDIAN: [u8; 3] = [0x10, 0x00, 0x00];

/// Last fragment flag in flags1.
pub const FLAGS1_LAST_FRAGMENT: u8 = 0x02;

/// Idempotent call flag in flags1.
pub const FLAGS1_IDEMPOTENT: u8 = 0x20;

/// Packet type of a connectionless RPC PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RpcPacketType {
    /// Client call.
    Request = 0,
    /// Server answer.
    Response = 2,
    /// Server fault, carries a status in the body.
    Fault = 3,
    /// Server rejected the call outright.
    Reject = 6,
}

impl RpcPacketType {
    /// Decode a packet type byte.
    pub fn from_wire(value: u8) -> EncodingResult<RpcPacketType> {
        match value {
            0 => Ok(RpcPacketType::Request),
            2 => Ok(RpcPacketType::Response),
            3 => Ok(RpcPacketType::Fault),
            6 => Ok(RpcPacketType::Reject),
            other => Err(Error::field_out_of_range(format!(
                "RPC packet type {other} is not handled"
            ))),
        }
    }
}

/// Operation numbers of the PNIO device interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opnum {
    /// Establish an AR.
    Connect = 0,
    /// Tear an AR down.
    Release = 1,
    /// Acyclic record read.
    Read = 2,
    /// Acyclic record write.
    Write = 3,
    /// Control (PrmEnd, ApplicationReady).
    Control = 4,
    /// Read outside any AR.
    ReadImplicit = 5,
}

impl Opnum {
    /// Decode an opnum.
    pub fn from_wire(value: u16) -> EncodingResult<Opnum> {
        match value {
            0 => Ok(Opnum::Connect),
            1 => Ok(Opnum::Release),
            2 => Ok(Opnum::Read),
            3 => Ok(Opnum::Write),
            4 => Ok(Opnum::Control),
            5 => Ok(Opnum::ReadImplicit),
            other => Err(Error::field_out_of_range(format!(
                "opnum {other} is not part of the PNIO interface"
            ))),
        }
    }
}

/// The connectionless DCE/RPC header.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcHeader {
    /// Always [`RPC_VERSION`].
    pub version: u8,
    /// Request, Response, Fault or Reject.
    pub packet_type: RpcPacketType,
    /// Fragment and idempotency flags.
    pub flags1: u8,
    /// Second flag byte, unused here.
    pub flags2: u8,
    /// Data representation, always [`DREP_LITTLE_ENDIAN`].
    pub drep: [u8; 3],
    /// High byte of the fragment serial number.
    pub serial_high: u8,
    /// The object this call addresses: the AR UUID, not the interface UUID.
    pub object_uuid: PnUuid,
    /// The PNIO device interface UUID.
    pub interface_uuid: PnUuid,
    /// Correlates all packets of one activity.
    pub activity_uuid: PnUuid,
    /// Server boot time learned from responses, 0 on first contact.
    pub server_boot_time: u32,
    /// Interface version, 1.
    pub interface_version: u32,
    /// Call sequence number.
    pub sequence_number: u32,
    /// Which operation of the interface is called.
    pub opnum: u16,
    /// Interface hint, 0xFFFF when unknown.
    pub interface_hint: u16,
    /// Activity hint, 0xFFFF when unknown.
    pub activity_hint: u16,
    /// Byte length of the body following this header.
    pub fragment_length: u16,
    /// Fragment number, 0 for unfragmented calls.
    pub fragment_number: u16,
    /// Authentication protocol, 0 for none.
    pub auth_protocol: u8,
    /// Low byte of the fragment serial number.
    pub serial_low: u8,
}

impl RpcHeader {
    /// Build an idempotent single-fragment request header.
    pub fn request(
        object_uuid: PnUuid,
        activity_uuid: PnUuid,
        sequence_number: u32,
        opnum: Opnum,
        fragment_length: u16,
    ) -> RpcHeader {
        RpcHeader {
            version: RPC_VERSION,
            packet_type: RpcPacketType::Request,
            flags1: FLAGS1_LAST_FRAGMENT | FLAGS1_IDEMPOTENT,
            flags2: 0,
            drep: DREP_LITTLE_ENDIAN,
            serial_high: 0,
            object_uuid,
            interface_uuid: profinet_types::PNIO_DEVICE_INTERFACE_UUID,
            activity_uuid,
            server_boot_time: 0,
            interface_version: 1,
            sequence_number,
            opnum: opnum as u16,
            interface_hint: 0xFFFF,
            activity_hint: 0xFFFF,
            fragment_length,
            fragment_number: 0,
            auth_protocol: 0,
            serial_low: 0,
        }
    }

    /// Build the response header answering `request`, reusing its identities.
    pub fn response_to(request: &RpcHeader, fragment_length: u16) -> RpcHeader {
        RpcHeader {
            packet_type: RpcPacketType::Response,
            flags1: FLAGS1_LAST_FRAGMENT,
            fragment_length,
            ..request.clone()
        }
    }
}

impl BinaryEncodable for RpcHeader {
    fn byte_len(&self) -> usize {
        RPC_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u8(stream, self.version)?;
        write_u8(stream, self.packet_type as u8)?;
        write_u8(stream, self.flags1)?;
        write_u8(stream, self.flags2)?;
        process_encode_io_result(stream.write_all(&self.drep))?;
        write_u8(stream, self.serial_high)?;
        // Header UUIDs go out with their first three sub-fields little-endian.
        self.object_uuid.swap_drep().encode(stream)?;
        self.interface_uuid.swap_drep().encode(stream)?;
        self.activity_uuid.swap_drep().encode(stream)?;
        write_u32_le(stream, self.server_boot_time)?;
        write_u32_le(stream, self.interface_version)?;
        write_u32_le(stream, self.sequence_number)?;
        write_u16_le(stream, self.opnum)?;
        write_u16_le(stream, self.interface_hint)?;
        write_u16_le(stream, self.activity_hint)?;
        write_u16_le(stream, self.fragment_length)?;
        write_u16_le(stream, self.fragment_number)?;
        write_u8(stream, self.auth_protocol)?;
        write_u8(stream, self.serial_low)
    }
}

impl BinaryDecodable for RpcHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let version = read_u8(stream)?;
        if version != RPC_VERSION {
            return Err(Error::unsupported_version(format!(
                "RPC version {version}, expected {RPC_VERSION}"
            )));
        }
        let packet_type = RpcPacketType::from_wire(read_u8(stream)?)?;
        let flags1 = read_u8(stream)?;
        let flags2 = read_u8(stream)?;
        let mut drep = [0u8; 3];
        process_decode_io_result(stream.read_exact(&mut drep))?;
        if drep[0] & 0xF0 != 0x10 {
            return Err(Error::field_out_of_range(format!(
                "DREP {:#04X} is big-endian, only little-endian peers are supported",
                drep[0]
            )));
        }
        let serial_high = read_u8(stream)?;
        let object_uuid = PnUuid::decode(stream)?.swap_drep();
        let interface_uuid = PnUuid::decode(stream)?.swap_drep();
        let activity_uuid = PnUuid::decode(stream)?.swap_drep();
        let server_boot_time = read_u32_le(stream)?;
        let interface_version = read_u32_le(stream)?;
        let sequence_number = read_u32_le(stream)?;
        let opnum = read_u16_le(stream)?;
        let interface_hint = read_u16_le(stream)?;
        let activity_hint = read_u16_le(stream)?;
        let fragment_length = read_u16_le(stream)?;
        let fragment_number = read_u16_le(stream)?;
        let auth_protocol = read_u8(stream)?;
        let serial_low = read_u8(stream)?;
        Ok(RpcHeader {
            version,
            packet_type,
            flags1,
            flags2,
            drep,
            serial_high,
            object_uuid,
            interface_uuid,
            activity_uuid,
            server_boot_time,
            interface_version,
            sequence_number,
            opnum,
            interface_hint,
            activity_hint,
            fragment_length,
            fragment_number,
            auth_protocol,
            serial_low,
        })
    }
}
