// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! ExpectedSubmoduleBlockReq and its sub-structures.

use std::io::{Read, Write};

use super::{BlockHeader, BlockType};
use crate::encoding::*;

/// Submodule IO capability encoded in the low bits of SubmoduleProperties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SubmoduleType {
    /// No cyclic IO, e.g. the DAP.
    NoIo = 0,
    /// Device to controller.
    Input = 1,
    /// Controller to device.
    Output = 2,
    /// Both directions.
    InputOutput = 3,
}

impl SubmoduleType {
    /// Decode from the low two bits of SubmoduleProperties.
    pub fn from_properties(properties: u16) -> SubmoduleType {
        match properties & 0x0003 {
            0 => SubmoduleType::NoIo,
            1 => SubmoduleType::Input,
            2 => SubmoduleType::Output,
            _ => SubmoduleType::InputOutput,
        }
    }
}

/// Direction tag of a [`DataDescription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DataDirection {
    /// Describes the input (device to controller) data of the submodule.
    Input = 1,
    /// Describes the output (controller to device) data of the submodule.
    Output = 2,
}

impl DataDirection {
    /// Decode a DataDescription direction tag.
    pub fn from_wire(value: u16) -> EncodingResult<DataDirection> {
        match value {
            1 => Ok(DataDirection::Input),
            2 => Ok(DataDirection::Output),
            other => Err(Error::field_out_of_range(format!(
                "data description type {other} is not known"
            ))),
        }
    }
}

/// Expected IO geometry of one submodule in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescription {
    /// Which direction this describes.
    pub direction: DataDirection,
    /// IO data length in bytes, 0 for NO_IO.
    pub length_io_data: u16,
    /// Provider status length, always 1.
    pub length_iops: u8,
    /// Consumer status length, always 1.
    pub length_iocs: u8,
}

impl DataDescription {
    /// A NO_IO description for the given direction, as the DAP carries.
    pub fn no_io(direction: DataDirection) -> DataDescription {
        DataDescription {
            direction,
            length_io_data: 0,
            length_iops: 1,
            length_iocs: 1,
        }
    }
}

/// One expected submodule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSubmodule {
    /// Subslot number.
    pub subslot: u16,
    /// Submodule ident from the device's GSD.
    pub submodule_ident: u32,
    /// Property bits; the low two bits carry the [`SubmoduleType`].
    pub submodule_properties: u16,
    /// One description per direction the submodule carries data in. A NO_IO
    /// submodule carries a single description matching the direction of the
    /// IOCR being described.
    pub data_descriptions: Vec<DataDescription>,
}

/// One expected slot, wrapped in its API grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedApi {
    /// Application process identifier, 0 for the default API.
    pub api: u32,
    /// Slot number.
    pub slot: u16,
    /// Module ident from the device's GSD.
    pub module_ident: u32,
    /// Module property bits.
    pub module_properties: u16,
    /// The submodules this slot must carry.
    pub submodules: Vec<ExpectedSubmodule>,
}

/// The ExpectedSubmoduleBlockReq announcing what the controller expects to find plugged.
///
/// One block carries one slot; Connect requests concatenate one block per configured slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedSubmoduleBlockReq {
    /// The slot grouping, one API entry per block.
    pub apis: Vec<ExpectedApi>,
}

impl ExpectedSubmoduleBlockReq {
    /// A block for a single slot under the default API.
    pub fn single(slot: u16, module_ident: u32, submodules: Vec<ExpectedSubmodule>) -> Self {
        ExpectedSubmoduleBlockReq {
            apis: vec![ExpectedApi {
                api: 0,
                slot,
                module_ident,
                module_properties: 0,
                submodules,
            }],
        }
    }

    fn body_len(&self) -> usize {
        let mut len = 2;
        for api in &self.apis {
            len += 4 + 2 + 4 + 2 + 2;
            for sub in &api.submodules {
                len += 2 + 4 + 2 + sub.data_descriptions.len() * 6;
            }
        }
        len
    }
}

impl BinaryEncodable for ExpectedSubmoduleBlockReq {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + self.body_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::ExpectedSubmoduleBlockReq, self.body_len()).encode(stream)?;
        write_u16(stream, self.apis.len() as u16)?;
        for api in &self.apis {
            write_u32(stream, api.api)?;
            write_u16(stream, api.slot)?;
            write_u32(stream, api.module_ident)?;
            write_u16(stream, api.module_properties)?;
            write_u16(stream, api.submodules.len() as u16)?;
            for sub in &api.submodules {
                write_u16(stream, sub.subslot)?;
                write_u32(stream, sub.submodule_ident)?;
                write_u16(stream, sub.submodule_properties)?;
                for desc in &sub.data_descriptions {
                    write_u16(stream, desc.direction as u16)?;
                    write_u16(stream, desc.length_io_data)?;
                    write_u8(stream, desc.length_iops)?;
                    write_u8(stream, desc.length_iocs)?;
                }
            }
        }
        Ok(())
    }
}

impl BinaryDecodable for ExpectedSubmoduleBlockReq {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::ExpectedSubmoduleBlockReq)?;
        let api_count = read_u16(stream)? as usize;
        let mut apis = Vec::with_capacity(api_count);
        for _ in 0..api_count {
            let api = read_u32(stream)?;
            let slot = read_u16(stream)?;
            let module_ident = read_u32(stream)?;
            let module_properties = read_u16(stream)?;
            let submodule_count = read_u16(stream)? as usize;
            let mut submodules = Vec::with_capacity(submodule_count);
            for _ in 0..submodule_count {
                let subslot = read_u16(stream)?;
                let submodule_ident = read_u32(stream)?;
                let submodule_properties = read_u16(stream)?;
                let desc_count = match SubmoduleType::from_properties(submodule_properties) {
                    SubmoduleType::InputOutput => 2,
                    _ => 1,
                };
                let mut data_descriptions = Vec::with_capacity(desc_count);
                for _ in 0..desc_count {
                    let direction = DataDirection::from_wire(read_u16(stream)?)?;
                    let length_io_data = read_u16(stream)?;
                    let length_iops = read_u8(stream)?;
                    let length_iocs = read_u8(stream)?;
                    data_descriptions.push(DataDescription {
                        direction,
                        length_io_data,
                        length_iops,
                        length_iocs,
                    });
                }
                submodules.push(ExpectedSubmodule {
                    subslot,
                    submodule_ident,
                    submodule_properties,
                    data_descriptions,
                });
            }
            apis.push(ExpectedApi {
                api,
                slot,
                module_ident,
                module_properties,
                submodules,
            });
        }
        Ok(ExpectedSubmoduleBlockReq { apis })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dap_block_round_trip() {
        // The DAP: slot 0, subslot 1, NO_IO described in the input direction.
        let block = ExpectedSubmoduleBlockReq::single(
            0,
            0x0000_0010,
            vec![ExpectedSubmodule {
                subslot: 1,
                submodule_ident: 0x0000_0011,
                submodule_properties: SubmoduleType::NoIo as u16,
                data_descriptions: vec![DataDescription::no_io(DataDirection::Input)],
            }],
        );
        let bytes = block.encode_to_vec();
        assert_eq!(bytes.len(), block.byte_len());
        let decoded = ExpectedSubmoduleBlockReq::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.encode_to_vec(), bytes);
    }

    #[test]
    fn io_submodule_round_trip() {
        let block = ExpectedSubmoduleBlockReq::single(
            2,
            0x0000_0120,
            vec![ExpectedSubmodule {
                subslot: 1,
                submodule_ident: 0x0000_0121,
                submodule_properties: SubmoduleType::InputOutput as u16,
                data_descriptions: vec![
                    DataDescription {
                        direction: DataDirection::Input,
                        length_io_data: 5,
                        length_iops: 1,
                        length_iocs: 1,
                    },
                    DataDescription {
                        direction: DataDirection::Output,
                        length_io_data: 4,
                        length_iops: 1,
                        length_iocs: 1,
                    },
                ],
            }],
        );
        let bytes = block.encode_to_vec();
        let decoded = ExpectedSubmoduleBlockReq::decode(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn wire_layout_field_order() {
        // API u32, SlotNumber u16, ModuleIdentNumber u32, ModuleProperties u16,
        // NumberOfSubmodules u16, then submodule records.
        let block = ExpectedSubmoduleBlockReq::single(
            3,
            0xAABB_CCDD,
            vec![ExpectedSubmodule {
                subslot: 1,
                submodule_ident: 0x1122_3344,
                submodule_properties: SubmoduleType::Input as u16,
                data_descriptions: vec![DataDescription {
                    direction: DataDirection::Input,
                    length_io_data: 5,
                    length_iops: 1,
                    length_iocs: 1,
                }],
            }],
        );
        let bytes = block.encode_to_vec();
        let body = &bytes[super::super::BLOCK_HEADER_LEN..];
        assert_eq!(&body[0..2], &[0x00, 0x01]); // NumberOfAPIs
        assert_eq!(&body[2..6], &[0x00, 0x00, 0x00, 0x00]); // API
        assert_eq!(&body[6..8], &[0x00, 0x03]); // SlotNumber
        assert_eq!(&body[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]); // ModuleIdentNumber
        assert_eq!(&body[12..14], &[0x00, 0x00]); // ModuleProperties
        assert_eq!(&body[14..16], &[0x00, 0x01]); // NumberOfSubmodules
        assert_eq!(&body[16..18], &[0x00, 0x01]); // SubslotNumber
        assert_eq!(&body[18..22], &[0x11, 0x22, 0x33, 0x44]); // SubmoduleIdentNumber
        assert_eq!(&body[22..24], &[0x00, 0x01]); // SubmoduleProperties, Input
        // DataDescription is exactly six bytes: Type, LengthIOData, LengthIOPS, LengthIOCS.
        assert_eq!(&body[24..30], &[0x00, 0x01, 0x00, 0x05, 0x01, 0x01]);
        // Nothing follows it; the announced block length agrees.
        assert_eq!(body.len(), 30);
        let announced = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + announced);
    }
}
