// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The PNIO block families carried inside RPC payloads.
//!
//! Every block begins with a 2-byte block type, a 2-byte length and a 2-byte version. The length
//! counts everything after the type and length fields, so the version bytes are included. Blocks
//! concatenate directly with no padding between them.

mod alarm;
mod ar;
mod control;
mod expected;
mod iocr;
mod records;

pub use alarm::{AlarmCrBlockReq, AlarmCrBlockRes};
pub use ar::{ArBlockReq, ArBlockRes, ArProperties, AR_TYPE_IOCAR_SINGLE};
pub use control::{ControlBlock, ControlCommand};
pub use expected::{
    DataDescription, DataDirection, ExpectedApi, ExpectedSubmodule, ExpectedSubmoduleBlockReq,
    SubmoduleType,
};
pub use iocr::{
    IocrApi, IocrBlockReq, IocrBlockRes, IocrCs, IocrIoDataObject, IocrType, IOCR_PROPERTIES_RT_CLASS_1,
};
pub use records::{IodReadReqHeader, IodReadResHeader, IodWriteReqHeader, IodWriteResHeader};

use std::io::{Read, Write};

use crate::encoding::*;

/// Size of the {type, length, version} header every block begins with.
pub const BLOCK_HEADER_LEN: usize = 6;

/// Block type discriminants used by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BlockType {
    /// AR request from the controller.
    ArBlockReq = 0x0101,
    /// IO communication relationship request.
    IocrBlockReq = 0x0102,
    /// Alarm communication relationship request.
    AlarmCrBlockReq = 0x0103,
    /// Expected slot and submodule layout.
    ExpectedSubmoduleBlockReq = 0x0104,
    /// PrmEnd control request.
    IodControlPrmEndReq = 0x0110,
    /// ApplicationReady control request, sent by the device.
    IodControlApplicationReadyReq = 0x0112,
    /// Release control request.
    IodControlReleaseReq = 0x0114,
    /// Record write request header.
    IodWriteReqHeader = 0x0008,
    /// Record read request header.
    IodReadReqHeader = 0x0009,
    /// AR response from the device.
    ArBlockRes = 0x8101,
    /// IOCR response.
    IocrBlockRes = 0x8102,
    /// AlarmCR response.
    AlarmCrBlockRes = 0x8103,
    /// Module difference report from the device.
    ModuleDiffBlock = 0x8104,
    /// PrmEnd control response.
    IodControlPrmEndRes = 0x8110,
    /// ApplicationReady control response, sent by the controller.
    IodControlApplicationReadyRes = 0x8112,
    /// Release control response.
    IodControlReleaseRes = 0x8114,
    /// Record write response header.
    IodWriteResHeader = 0x8008,
    /// Record read response header.
    IodReadResHeader = 0x8009,
}

impl BlockType {
    /// Decode a block type discriminant.
    pub fn from_wire(value: u16) -> EncodingResult<BlockType> {
        let t = match value {
            0x0101 => BlockType::ArBlockReq,
            0x0102 => BlockType::IocrBlockReq,
            0x0103 => BlockType::AlarmCrBlockReq,
            0x0104 => BlockType::ExpectedSubmoduleBlockReq,
            0x0110 => BlockType::IodControlPrmEndReq,
            0x0112 => BlockType::IodControlApplicationReadyReq,
            0x0114 => BlockType::IodControlReleaseReq,
            0x0008 => BlockType::IodWriteReqHeader,
            0x0009 => BlockType::IodReadReqHeader,
            0x8101 => BlockType::ArBlockRes,
            0x8102 => BlockType::IocrBlockRes,
            0x8103 => BlockType::AlarmCrBlockRes,
            0x8104 => BlockType::ModuleDiffBlock,
            0x8110 => BlockType::IodControlPrmEndRes,
            0x8112 => BlockType::IodControlApplicationReadyRes,
            0x8114 => BlockType::IodControlReleaseRes,
            0x8008 => BlockType::IodWriteResHeader,
            0x8009 => BlockType::IodReadResHeader,
            other => {
                return Err(Error::invalid_block_type(format!(
                    "block type {other:#06X} is not known"
                )))
            }
        };
        Ok(t)
    }
}

/// The {type, length, version} header every block begins with.
///
/// `block_length` counts the version bytes plus the body, per IEC 61158-6-10 accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block discriminant.
    pub block_type: BlockType,
    /// Byte count of everything after the type and length fields.
    pub block_length: u16,
    /// Version high byte, always 1.
    pub version_high: u8,
    /// Version low byte, always 0.
    pub version_low: u8,
}

impl BlockHeader {
    /// Build a header for a block whose body (after the version bytes) is `body_len` bytes.
    pub fn new(block_type: BlockType, body_len: usize) -> BlockHeader {
        BlockHeader {
            block_type,
            block_length: (body_len + 2) as u16,
            version_high: 1,
            version_low: 0,
        }
    }

    /// Length in bytes of the block body following the version bytes.
    pub fn body_len(&self) -> usize {
        (self.block_length as usize).saturating_sub(2)
    }

    /// Decode a header and verify it announces the expected block type.
    pub fn decode_expecting<S: Read + ?Sized>(
        stream: &mut S,
        expected: BlockType,
    ) -> EncodingResult<BlockHeader> {
        let header = BlockHeader::decode(stream)?;
        if header.block_type != expected {
            return Err(Error::invalid_block_type(format!(
                "expected {:?}, found {:?}",
                expected, header.block_type
            )));
        }
        Ok(header)
    }
}

impl BinaryEncodable for BlockHeader {
    fn byte_len(&self) -> usize {
        BLOCK_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u16(stream, self.block_type as u16)?;
        write_u16(stream, self.block_length)?;
        write_u8(stream, self.version_high)?;
        write_u8(stream, self.version_low)
    }
}

impl BinaryDecodable for BlockHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let block_type = BlockType::from_wire(read_u16(stream)?)?;
        let block_length = read_u16(stream)?;
        if block_length < 2 {
            return Err(Error::invalid_length(format!(
                "block length {block_length} cannot hold the version bytes"
            )));
        }
        let version_high = read_u8(stream)?;
        let version_low = read_u8(stream)?;
        if version_high != 1 || version_low != 0 {
            return Err(Error::unsupported_version(format!(
                "block version {version_high}.{version_low}, only 1.0 is supported"
            )));
        }
        Ok(BlockHeader {
            block_type,
            block_length,
            version_high,
            version_low,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = BlockHeader::new(BlockType::ArBlockReq, 54);
        let bytes = header.encode_to_vec();
        assert_eq!(bytes.len(), BLOCK_HEADER_LEN);
        assert_eq!(&bytes[0..2], &[0x01, 0x01]);
        assert_eq!(&bytes[2..4], &[0x00, 0x38]);
        assert_eq!(&bytes[4..6], &[1, 0]);
        let decoded = BlockHeader::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.body_len(), 54);
    }

    #[test]
    fn unknown_type_rejected() {
        let bytes = [0x77u8, 0x77, 0x00, 0x04, 0x01, 0x00];
        let err = BlockHeader::decode(&mut bytes.as_slice()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidBlockType);
    }

    #[test]
    fn bad_version_rejected() {
        let bytes = [0x01u8, 0x01, 0x00, 0x04, 0x02, 0x00];
        let err = BlockHeader::decode(&mut bytes.as_slice()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedVersion);
    }
}
