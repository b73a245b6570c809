// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The IODControl block shared by PrmEnd, ApplicationReady and Release.

use std::io::{Read, Write};

use super::{BlockHeader, BlockType};
use crate::{encoding::*, uuid::PnUuid};

/// ControlCommand bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlCommand {
    /// Parameterisation finished.
    PrmEnd = 0x0001,
    /// Device signals readiness for cyclic exchange.
    ApplicationReady = 0x0002,
    /// AR teardown.
    Release = 0x0004,
    /// Acknowledgement of one of the above.
    Done = 0x0008,
}

impl ControlCommand {
    /// Decode a control command word.
    pub fn from_wire(value: u16) -> EncodingResult<ControlCommand> {
        match value {
            0x0001 => Ok(ControlCommand::PrmEnd),
            0x0002 => Ok(ControlCommand::ApplicationReady),
            0x0004 => Ok(ControlCommand::Release),
            0x0008 => Ok(ControlCommand::Done),
            other => Err(Error::field_out_of_range(format!(
                "control command {other:#06X} is not known"
            ))),
        }
    }
}

/// One IODControl request or response block. The block type distinguishes PrmEnd,
/// ApplicationReady and Release as well as request from response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlBlock {
    /// Which control block this is on the wire.
    pub block_type: BlockType,
    /// The AR this controls.
    pub ar_uuid: PnUuid,
    /// Session key of the AR.
    pub session_key: u16,
    /// Command word.
    pub control_command: ControlCommand,
    /// Properties, 0 unless a command defines some.
    pub control_block_properties: u16,
}

impl ControlBlock {
    /// A PrmEnd request for the given AR.
    pub fn prm_end(ar_uuid: PnUuid, session_key: u16) -> ControlBlock {
        ControlBlock {
            block_type: BlockType::IodControlPrmEndReq,
            ar_uuid,
            session_key,
            control_command: ControlCommand::PrmEnd,
            control_block_properties: 0,
        }
    }

    /// A Release request for the given AR.
    pub fn release(ar_uuid: PnUuid, session_key: u16) -> ControlBlock {
        ControlBlock {
            block_type: BlockType::IodControlReleaseReq,
            ar_uuid,
            session_key,
            control_command: ControlCommand::Release,
            control_block_properties: 0,
        }
    }

    /// The ApplicationReady acknowledgement the controller answers a device's
    /// ApplicationReady request with.
    pub fn application_ready_res(ar_uuid: PnUuid, session_key: u16) -> ControlBlock {
        ControlBlock {
            block_type: BlockType::IodControlApplicationReadyRes,
            ar_uuid,
            session_key,
            control_command: ControlCommand::Done,
            control_block_properties: 0,
        }
    }
}

impl BinaryEncodable for ControlBlock {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + 2 + 16 + 2 + 2 + 2 + 2
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let body_len = self.byte_len() - super::BLOCK_HEADER_LEN;
        BlockHeader::new(self.block_type, body_len).encode(stream)?;
        write_u16(stream, 0)?; // reserved
        self.ar_uuid.encode(stream)?;
        write_u16(stream, self.session_key)?;
        write_u16(stream, 0)?; // reserved
        write_u16(stream, self.control_command as u16)?;
        write_u16(stream, self.control_block_properties)
    }
}

impl BinaryDecodable for ControlBlock {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        let header = BlockHeader::decode(stream)?;
        match header.block_type {
            BlockType::IodControlPrmEndReq
            | BlockType::IodControlPrmEndRes
            | BlockType::IodControlApplicationReadyReq
            | BlockType::IodControlApplicationReadyRes
            | BlockType::IodControlReleaseReq
            | BlockType::IodControlReleaseRes => {}
            other => {
                return Err(Error::invalid_block_type(format!(
                    "expected a control block, found {other:?}"
                )))
            }
        }
        skip_bytes(stream, 2)?;
        let ar_uuid = PnUuid::decode(stream)?;
        let session_key = read_u16(stream)?;
        skip_bytes(stream, 2)?;
        let control_command = ControlCommand::from_wire(read_u16(stream)?)?;
        let control_block_properties = read_u16(stream)?;
        Ok(ControlBlock {
            block_type: header.block_type,
            ar_uuid,
            session_key,
            control_command,
            control_block_properties,
        })
    }
}
