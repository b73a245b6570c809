// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! IODRead and IODWrite request/response headers for acyclic record access.
//!
//! All four headers occupy exactly 64 bytes on the wire; trailing padding fills whatever the
//! variant's fields leave unused.

use std::io::{Read, Write};

use super::{BlockHeader, BlockType};
use crate::{encoding::*, status::PnioStatus, uuid::PnUuid};

/// Total wire size of every IOD read/write header block.
pub const IOD_HEADER_LEN: usize = 64;

/// The IODReadReqHeader preceding a record read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IodReadReqHeader {
    /// Sequence number within the AR.
    pub seq_number: u16,
    /// The AR this read belongs to.
    pub ar_uuid: PnUuid,
    /// API addressed.
    pub api: u32,
    /// Slot addressed.
    pub slot: u16,
    /// Subslot addressed.
    pub subslot: u16,
    /// Record index, e.g. 0xAFF0 for I&M0.
    pub index: u16,
    /// Largest record the caller accepts.
    pub record_data_length: u32,
}

impl BinaryEncodable for IodReadReqHeader {
    fn byte_len(&self) -> usize {
        IOD_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::IodReadReqHeader, IOD_HEADER_LEN - super::BLOCK_HEADER_LEN)
            .encode(stream)?;
        write_u16(stream, self.seq_number)?;
        self.ar_uuid.encode(stream)?;
        write_u32(stream, self.api)?;
        write_u16(stream, self.slot)?;
        write_u16(stream, self.subslot)?;
        write_u16(stream, 0)?; // padding
        write_u16(stream, self.index)?;
        write_u32(stream, self.record_data_length)?;
        write_bytes(stream, 0, 24)?;
        Ok(())
    }
}

impl BinaryDecodable for IodReadReqHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::IodReadReqHeader)?;
        let seq_number = read_u16(stream)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let api = read_u32(stream)?;
        let slot = read_u16(stream)?;
        let subslot = read_u16(stream)?;
        skip_bytes(stream, 2)?;
        let index = read_u16(stream)?;
        let record_data_length = read_u32(stream)?;
        skip_bytes(stream, 24)?;
        Ok(IodReadReqHeader {
            seq_number,
            ar_uuid,
            api,
            slot,
            subslot,
            index,
            record_data_length,
        })
    }
}

/// The IODWriteReqHeader preceding record data on a write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IodWriteReqHeader {
    /// Sequence number within the AR.
    pub seq_number: u16,
    /// The AR this write belongs to.
    pub ar_uuid: PnUuid,
    /// API addressed.
    pub api: u32,
    /// Slot addressed.
    pub slot: u16,
    /// Subslot addressed.
    pub subslot: u16,
    /// Record index.
    pub index: u16,
    /// Length of the record data following this header.
    pub record_data_length: u32,
}

impl BinaryEncodable for IodWriteReqHeader {
    fn byte_len(&self) -> usize {
        IOD_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::IodWriteReqHeader, IOD_HEADER_LEN - super::BLOCK_HEADER_LEN)
            .encode(stream)?;
        write_u16(stream, self.seq_number)?;
        self.ar_uuid.encode(stream)?;
        write_u32(stream, self.api)?;
        write_u16(stream, self.slot)?;
        write_u16(stream, self.subslot)?;
        write_u16(stream, 0)?; // padding
        write_u16(stream, self.index)?;
        write_u32(stream, self.record_data_length)?;
        write_bytes(stream, 0, 24)?;
        Ok(())
    }
}

impl BinaryDecodable for IodWriteReqHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::IodWriteReqHeader)?;
        let seq_number = read_u16(stream)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let api = read_u32(stream)?;
        let slot = read_u16(stream)?;
        let subslot = read_u16(stream)?;
        skip_bytes(stream, 2)?;
        let index = read_u16(stream)?;
        let record_data_length = read_u32(stream)?;
        skip_bytes(stream, 24)?;
        Ok(IodWriteReqHeader {
            seq_number,
            ar_uuid,
            api,
            slot,
            subslot,
            index,
            record_data_length,
        })
    }
}

/// The IODReadResHeader preceding record data in a read response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IodReadResHeader {
    /// Sequence number echoed from the request.
    pub seq_number: u16,
    /// The AR echoed from the request.
    pub ar_uuid: PnUuid,
    /// API echoed from the request.
    pub api: u32,
    /// Slot echoed from the request.
    pub slot: u16,
    /// Subslot echoed from the request.
    pub subslot: u16,
    /// Record index echoed from the request.
    pub index: u16,
    /// Length of the record data following this header.
    pub record_data_length: u32,
    /// Vendor specific additional value.
    pub additional_value_1: u16,
    /// Vendor specific additional value.
    pub additional_value_2: u16,
}

impl BinaryDecodable for IodReadResHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::IodReadResHeader)?;
        let seq_number = read_u16(stream)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let api = read_u32(stream)?;
        let slot = read_u16(stream)?;
        let subslot = read_u16(stream)?;
        skip_bytes(stream, 2)?;
        let index = read_u16(stream)?;
        let record_data_length = read_u32(stream)?;
        let additional_value_1 = read_u16(stream)?;
        let additional_value_2 = read_u16(stream)?;
        skip_bytes(stream, 20)?;
        Ok(IodReadResHeader {
            seq_number,
            ar_uuid,
            api,
            slot,
            subslot,
            index,
            record_data_length,
            additional_value_1,
            additional_value_2,
        })
    }
}

impl BinaryEncodable for IodReadResHeader {
    fn byte_len(&self) -> usize {
        IOD_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::IodReadResHeader, IOD_HEADER_LEN - super::BLOCK_HEADER_LEN)
            .encode(stream)?;
        write_u16(stream, self.seq_number)?;
        self.ar_uuid.encode(stream)?;
        write_u32(stream, self.api)?;
        write_u16(stream, self.slot)?;
        write_u16(stream, self.subslot)?;
        write_u16(stream, 0)?; // padding
        write_u16(stream, self.index)?;
        write_u32(stream, self.record_data_length)?;
        write_u16(stream, self.additional_value_1)?;
        write_u16(stream, self.additional_value_2)?;
        write_bytes(stream, 0, 20)?;
        Ok(())
    }
}

/// The IODWriteResHeader closing a record write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IodWriteResHeader {
    /// Sequence number echoed from the request.
    pub seq_number: u16,
    /// The AR echoed from the request.
    pub ar_uuid: PnUuid,
    /// API echoed from the request.
    pub api: u32,
    /// Slot echoed from the request.
    pub slot: u16,
    /// Subslot echoed from the request.
    pub subslot: u16,
    /// Record index echoed from the request.
    pub index: u16,
    /// Bytes the device accepted.
    pub record_data_length: u32,
    /// Vendor specific additional value.
    pub additional_value_1: u16,
    /// Vendor specific additional value.
    pub additional_value_2: u16,
    /// Outcome of the write.
    pub status: PnioStatus,
}

impl BinaryDecodable for IodWriteResHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::IodWriteResHeader)?;
        let seq_number = read_u16(stream)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let api = read_u32(stream)?;
        let slot = read_u16(stream)?;
        let subslot = read_u16(stream)?;
        skip_bytes(stream, 2)?;
        let index = read_u16(stream)?;
        let record_data_length = read_u32(stream)?;
        let additional_value_1 = read_u16(stream)?;
        let additional_value_2 = read_u16(stream)?;
        let status = PnioStatus::decode(stream)?;
        skip_bytes(stream, 16)?;
        Ok(IodWriteResHeader {
            seq_number,
            ar_uuid,
            api,
            slot,
            subslot,
            index,
            record_data_length,
            additional_value_1,
            additional_value_2,
            status,
        })
    }
}

impl BinaryEncodable for IodWriteResHeader {
    fn byte_len(&self) -> usize {
        IOD_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::IodWriteResHeader, IOD_HEADER_LEN - super::BLOCK_HEADER_LEN)
            .encode(stream)?;
        write_u16(stream, self.seq_number)?;
        self.ar_uuid.encode(stream)?;
        write_u32(stream, self.api)?;
        write_u16(stream, self.slot)?;
        write_u16(stream, self.subslot)?;
        write_u16(stream, 0)?; // padding
        write_u16(stream, self.index)?;
        write_u32(stream, self.record_data_length)?;
        write_u16(stream, self.additional_value_1)?;
        write_u16(stream, self.additional_value_2)?;
        self.status.encode(stream)?;
        write_bytes(stream, 0, 16)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_req_is_64_bytes() {
        let req = IodReadReqHeader {
            seq_number: 1,
            ar_uuid: PnUuid::from_bytes([5; 16]),
            api: 0,
            slot: 0,
            subslot: 1,
            index: 0xAFF0,
            record_data_length: 4096,
        };
        let bytes = req.encode_to_vec();
        assert_eq!(bytes.len(), IOD_HEADER_LEN);
        let decoded = IodReadReqHeader::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn write_res_round_trip() {
        let res = IodWriteResHeader {
            seq_number: 9,
            ar_uuid: PnUuid::from_bytes([5; 16]),
            api: 0,
            slot: 2,
            subslot: 1,
            index: 0x0300,
            record_data_length: 8,
            additional_value_1: 0,
            additional_value_2: 0,
            status: PnioStatus::OK,
        };
        let bytes = res.encode_to_vec();
        assert_eq!(bytes.len(), IOD_HEADER_LEN);
        let decoded = IodWriteResHeader::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, res);
    }

    #[test]
    fn write_req_round_trip() {
        let req = IodWriteReqHeader {
            seq_number: 2,
            ar_uuid: PnUuid::from_bytes([1; 16]),
            api: 0,
            slot: 3,
            subslot: 1,
            index: 0x0300,
            record_data_length: 12,
        };
        let bytes = req.encode_to_vec();
        assert_eq!(bytes.len(), IOD_HEADER_LEN);
        assert_eq!(IodWriteReqHeader::decode(&mut bytes.as_slice()).unwrap(), req);
    }
}
