// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! IOCRBlockReq in its input and output variants, and its response counterpart.

use std::io::{Read, Write};

use super::{BlockHeader, BlockType};
use crate::{
    constants::{IOCR_VLAN_TAG, PROFINET_ETHERTYPE},
    encoding::*,
};

/// IOCRProperties value for RT class 1 (unsynchronised real time).
pub const IOCR_PROPERTIES_RT_CLASS_1: u32 = 0x0000_0001;

/// Direction of an IO communication relationship, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IocrType {
    /// Device produces, controller consumes.
    Input = 0x0001,
    /// Controller produces, device consumes.
    Output = 0x0002,
}

impl IocrType {
    /// Decode an IOCRType discriminant.
    pub fn from_wire(value: u16) -> EncodingResult<IocrType> {
        match value {
            0x0001 => Ok(IocrType::Input),
            0x0002 => Ok(IocrType::Output),
            other => Err(Error::field_out_of_range(format!(
                "IOCRType {other:#06X} is not known"
            ))),
        }
    }
}

/// Placement of one submodule's IO data within the cyclic frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocrIoDataObject {
    /// Slot number.
    pub slot: u16,
    /// Subslot number.
    pub subslot: u16,
    /// Byte offset of the IO data within the frame's C_SDU.
    pub frame_offset: u16,
}

/// Placement of one submodule's consumer status byte within the cyclic frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocrCs {
    /// Slot number.
    pub slot: u16,
    /// Subslot number.
    pub subslot: u16,
    /// Byte offset of the status byte within the frame's C_SDU.
    pub frame_offset: u16,
}

/// Submodule placements grouped by API.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IocrApi {
    /// Application process identifier, 0 for the default API.
    pub api: u32,
    /// Data object placements in the direction this CR describes.
    pub io_data_objects: Vec<IocrIoDataObject>,
    /// Consumer status placements for the opposite direction.
    pub iocs: Vec<IocrCs>,
}

/// The IOCRBlockReq describing one cyclic frame stream.
#[derive(Debug, Clone, PartialEq)]
pub struct IocrBlockReq {
    /// Input or output variant.
    pub iocr_type: IocrType,
    /// Reference the device echoes in its response.
    pub iocr_reference: u16,
    /// EtherType of the cyclic frames, always 0x8892.
    pub lt_field: u16,
    /// Property bits, normally [`IOCR_PROPERTIES_RT_CLASS_1`].
    pub iocr_properties: u32,
    /// C_SDU length in bytes.
    pub data_length: u16,
    /// FrameID the producer stamps on each frame.
    pub frame_id: u16,
    /// Send clock in 31.25 us units.
    pub send_clock_factor: u16,
    /// Cycle reduction relative to the send clock.
    pub reduction_ratio: u16,
    /// Phase within the reduction, 1-based.
    pub phase: u16,
    /// Sequence, unused for RT class 1.
    pub sequence: u16,
    /// Frame send offset in ns, 0xFFFFFFFF for best effort.
    pub frame_send_offset: u32,
    /// Watchdog multiplier on the cycle time.
    pub watchdog_factor: u16,
    /// Data hold multiplier on the cycle time.
    pub data_hold_factor: u16,
    /// VLAN tag for the cyclic frames. Must carry priority 6 ([`IOCR_VLAN_TAG`]).
    pub iocr_tag_header: u16,
    /// Multicast MAC, zero for unicast CRs.
    pub iocr_multicast_mac: [u8; 6],
    /// Submodule placements grouped by API.
    pub apis: Vec<IocrApi>,
}

impl IocrBlockReq {
    /// Build a unicast RT class 1 request with conventional defaults.
    pub fn new_rt_class_1(
        iocr_type: IocrType,
        iocr_reference: u16,
        frame_id: u16,
        data_length: u16,
        send_clock_factor: u16,
        reduction_ratio: u16,
        watchdog_factor: u16,
        apis: Vec<IocrApi>,
    ) -> IocrBlockReq {
        IocrBlockReq {
            iocr_type,
            iocr_reference,
            lt_field: PROFINET_ETHERTYPE,
            iocr_properties: IOCR_PROPERTIES_RT_CLASS_1,
            data_length,
            frame_id,
            send_clock_factor,
            reduction_ratio,
            phase: 1,
            sequence: 0,
            frame_send_offset: 0xFFFF_FFFF,
            watchdog_factor,
            data_hold_factor: watchdog_factor,
            iocr_tag_header: IOCR_VLAN_TAG,
            iocr_multicast_mac: [0; 6],
            apis,
        }
    }

    fn body_len(&self) -> usize {
        let mut len = 2 + 2 + 2 + 4 + 2 + 2 + 2 + 2 + 2 + 2 + 4 + 2 + 2 + 2 + 6 + 2;
        for api in &self.apis {
            len += 4 + 2 + api.io_data_objects.len() * 6 + 2 + api.iocs.len() * 6;
        }
        len
    }
}

impl BinaryEncodable for IocrBlockReq {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + self.body_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        // Priority bits of zero make p-net and friends drop the CR without any
        // diagnostic, so refuse to encode them.
        if self.iocr_tag_header & 0xE000 == 0 {
            return Err(Error::field_out_of_range(format!(
                "IOCRTagHeader {:#06X} has no VLAN priority, expected {IOCR_VLAN_TAG:#06X}",
                self.iocr_tag_header
            )));
        }
        BlockHeader::new(BlockType::IocrBlockReq, self.body_len()).encode(stream)?;
        write_u16(stream, self.iocr_type as u16)?;
        write_u16(stream, self.iocr_reference)?;
        write_u16(stream, self.lt_field)?;
        write_u32(stream, self.iocr_properties)?;
        write_u16(stream, self.data_length)?;
        write_u16(stream, self.frame_id)?;
        write_u16(stream, self.send_clock_factor)?;
        write_u16(stream, self.reduction_ratio)?;
        write_u16(stream, self.phase)?;
        write_u16(stream, self.sequence)?;
        write_u32(stream, self.frame_send_offset)?;
        write_u16(stream, self.watchdog_factor)?;
        write_u16(stream, self.data_hold_factor)?;
        write_u16(stream, self.iocr_tag_header)?;
        process_encode_io_result(stream.write_all(&self.iocr_multicast_mac))?;
        write_u16(stream, self.apis.len() as u16)?;
        for api in &self.apis {
            write_u32(stream, api.api)?;
            write_u16(stream, api.io_data_objects.len() as u16)?;
            for obj in &api.io_data_objects {
                write_u16(stream, obj.slot)?;
                write_u16(stream, obj.subslot)?;
                write_u16(stream, obj.frame_offset)?;
            }
            write_u16(stream, api.iocs.len() as u16)?;
            for cs in &api.iocs {
                write_u16(stream, cs.slot)?;
                write_u16(stream, cs.subslot)?;
                write_u16(stream, cs.frame_offset)?;
            }
        }
        Ok(())
    }
}

impl BinaryDecodable for IocrBlockReq {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::IocrBlockReq)?;
        let iocr_type = IocrType::from_wire(read_u16(stream)?)?;
        let iocr_reference = read_u16(stream)?;
        let lt_field = read_u16(stream)?;
        let iocr_properties = read_u32(stream)?;
        let data_length = read_u16(stream)?;
        let frame_id = read_u16(stream)?;
        let send_clock_factor = read_u16(stream)?;
        let reduction_ratio = read_u16(stream)?;
        let phase = read_u16(stream)?;
        let sequence = read_u16(stream)?;
        let frame_send_offset = read_u32(stream)?;
        let watchdog_factor = read_u16(stream)?;
        let data_hold_factor = read_u16(stream)?;
        let iocr_tag_header = read_u16(stream)?;
        let mut iocr_multicast_mac = [0u8; 6];
        read_bytes(stream, &mut iocr_multicast_mac)?;
        let api_count = read_u16(stream)? as usize;
        let mut apis = Vec::with_capacity(api_count);
        for _ in 0..api_count {
            let api = read_u32(stream)?;
            let obj_count = read_u16(stream)? as usize;
            let mut io_data_objects = Vec::with_capacity(obj_count);
            for _ in 0..obj_count {
                io_data_objects.push(IocrIoDataObject {
                    slot: read_u16(stream)?,
                    subslot: read_u16(stream)?,
                    frame_offset: read_u16(stream)?,
                });
            }
            let cs_count = read_u16(stream)? as usize;
            let mut iocs = Vec::with_capacity(cs_count);
            for _ in 0..cs_count {
                iocs.push(IocrCs {
                    slot: read_u16(stream)?,
                    subslot: read_u16(stream)?,
                    frame_offset: read_u16(stream)?,
                });
            }
            apis.push(IocrApi {
                api,
                io_data_objects,
                iocs,
            });
        }
        Ok(IocrBlockReq {
            iocr_type,
            iocr_reference,
            lt_field,
            iocr_properties,
            data_length,
            frame_id,
            send_clock_factor,
            reduction_ratio,
            phase,
            sequence,
            frame_send_offset,
            watchdog_factor,
            data_hold_factor,
            iocr_tag_header,
            iocr_multicast_mac,
            apis,
        })
    }
}

/// The IOCRBlockRes acknowledging one CR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IocrBlockRes {
    /// Input or output variant.
    pub iocr_type: IocrType,
    /// Reference echoed from the request.
    pub iocr_reference: u16,
    /// FrameID the device settled on, which may differ from the requested one for input CRs.
    pub frame_id: u16,
}

impl BinaryDecodable for IocrBlockRes {
    fn decode<S: Read + ?Sized>(stream: &mut S) -> EncodingResult<Self> {
        BlockHeader::decode_expecting(stream, BlockType::IocrBlockRes)?;
        let iocr_type = IocrType::from_wire(read_u16(stream)?)?;
        let iocr_reference = read_u16(stream)?;
        let frame_id = read_u16(stream)?;
        Ok(IocrBlockRes {
            iocr_type,
            iocr_reference,
            frame_id,
        })
    }
}

impl BinaryEncodable for IocrBlockRes {
    fn byte_len(&self) -> usize {
        super::BLOCK_HEADER_LEN + 6
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        BlockHeader::new(BlockType::IocrBlockRes, 6).encode(stream)?;
        write_u16(stream, self.iocr_type as u16)?;
        write_u16(stream, self.iocr_reference)?;
        write_u16(stream, self.frame_id)
    }
}
