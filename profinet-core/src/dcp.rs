// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! DCP, the Layer 2 discovery and basic configuration protocol.
//!
//! The discovery engine multicasts Identify All requests, collects the responses into
//! [`DcpDevice`] records, and can provision unconfigured devices with Set requests carrying an
//! IP parameter or a station name.

use std::io::Cursor;
use std::net::Ipv4Addr;

use profinet_types::{
    constants::{
        DCP_GET_SET_FRAME_ID, DCP_IDENTIFY_FRAME_ID, DCP_IDENTIFY_MULTICAST,
        DCP_IDENTIFY_RESPONSE_FRAME_ID, MAX_STATION_NAME_LEN,
    },
    read_bytes, read_u16, read_u32, read_u8, write_u16, write_u32, write_u8, BinaryEncodable,
    EncodingResult, Error,
};

use crate::ethernet::EthernetHeader;

/// DCP service identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DcpServiceId {
    /// Read a single option.
    Get = 3,
    /// Write options.
    Set = 4,
    /// Identify devices.
    Identify = 5,
}

/// DCP service type: request or successful response.
pub const DCP_SERVICE_TYPE_REQUEST: u8 = 0;
/// Response bit plus success.
pub const DCP_SERVICE_TYPE_RESPONSE: u8 = 1;

const OPTION_IP: u8 = 1;
const SUBOPTION_IP_PARAMETER: u8 = 2;
const OPTION_DEVICE_PROPERTIES: u8 = 2;
const SUBOPTION_NAME_OF_STATION: u8 = 2;
const SUBOPTION_DEVICE_ID: u8 = 3;
const OPTION_CONTROL: u8 = 5;
const SUBOPTION_CONTROL_RESPONSE: u8 = 4;
const OPTION_ALL_SELECTOR: u8 = 0xFF;
const SUBOPTION_ALL: u8 = 0xFF;

/// Block qualifier asking the device to persist the written value.
const QUALIFIER_SAVE_PERMANENT: u16 = 0x0001;

/// Everything an Identify response tells us about one station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpDevice {
    /// Source MAC of the response.
    pub mac: [u8; 6],
    /// Station name, possibly empty for factory-fresh devices.
    pub station_name: String,
    /// Configured address, 0.0.0.0 when unconfigured.
    pub ip: Ipv4Addr,
    /// Configured netmask.
    pub netmask: Ipv4Addr,
    /// Configured gateway.
    pub gateway: Ipv4Addr,
    /// Vendor identifier.
    pub vendor_id: u16,
    /// Device identifier.
    pub device_id: u16,
}

impl DcpDevice {
    /// `true` when the device still needs an IP before RPC can reach it.
    pub fn needs_ip(&self) -> bool {
        self.ip.is_unspecified()
    }
}

/// A parsed DCP PDU of interest to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcpFrame {
    /// An Identify response describing one station.
    IdentifyResponse {
        /// Transaction the response answers.
        xid: u32,
        /// The station described.
        device: DcpDevice,
    },
    /// A Set response reporting per-option results.
    SetResponse {
        /// Transaction the response answers.
        xid: u32,
        /// Error byte of the first control block, 0 on success.
        error: u8,
    },
}

fn dcp_frame(
    dst: [u8; 6],
    src: [u8; 6],
    frame_id: u16,
    service_id: DcpServiceId,
    xid: u32,
    response_delay: u16,
    blocks: &[u8],
) -> EncodingResult<Vec<u8>> {
    let mut out = Vec::with_capacity(26 + blocks.len());
    EthernetHeader::new(dst, src).encode(&mut out)?;
    write_u16(&mut out, frame_id)?;
    write_u8(&mut out, service_id as u8)?;
    write_u8(&mut out, DCP_SERVICE_TYPE_REQUEST)?;
    write_u32(&mut out, xid)?;
    write_u16(&mut out, response_delay)?;
    write_u16(&mut out, blocks.len() as u16)?;
    out.extend_from_slice(blocks);
    Ok(out)
}

fn push_block(out: &mut Vec<u8>, option: u8, suboption: u8, payload: &[u8]) -> EncodingResult<()> {
    write_u8(out, option)?;
    write_u8(out, suboption)?;
    write_u16(out, payload.len() as u16)?;
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        write_u8(out, 0)?;
    }
    Ok(())
}

/// Build an Identify All multicast asking every station on the segment to report.
///
/// The response delay of 255 spreads the answers of a busy segment over time.
pub fn build_identify_all(src_mac: [u8; 6], xid: u32) -> EncodingResult<Vec<u8>> {
    let mut blocks = Vec::new();
    push_block(&mut blocks, OPTION_ALL_SELECTOR, SUBOPTION_ALL, &[])?;
    dcp_frame(
        DCP_IDENTIFY_MULTICAST,
        src_mac,
        DCP_IDENTIFY_FRAME_ID,
        DcpServiceId::Identify,
        xid,
        255,
        &blocks,
    )
}

/// Build a Set request provisioning `dst_mac` with an IP parameter.
pub fn build_set_ip(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    xid: u32,
    ip: Ipv4Addr,
    netmask: Ipv4Addr,
    gateway: Ipv4Addr,
) -> EncodingResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(14);
    write_u16(&mut payload, QUALIFIER_SAVE_PERMANENT)?;
    payload.extend_from_slice(&ip.octets());
    payload.extend_from_slice(&netmask.octets());
    payload.extend_from_slice(&gateway.octets());
    let mut blocks = Vec::new();
    push_block(&mut blocks, OPTION_IP, SUBOPTION_IP_PARAMETER, &payload)?;
    dcp_frame(
        dst_mac,
        src_mac,
        DCP_GET_SET_FRAME_ID,
        DcpServiceId::Set,
        xid,
        0,
        &blocks,
    )
}

/// Build a Set request writing a station name to `dst_mac`.
pub fn build_set_name(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    xid: u32,
    name: &str,
) -> EncodingResult<Vec<u8>> {
    if name.is_empty() || name.len() > MAX_STATION_NAME_LEN {
        return Err(Error::field_out_of_range(format!(
            "station name is {} bytes, must be 1..={MAX_STATION_NAME_LEN}",
            name.len()
        )));
    }
    let mut payload = Vec::with_capacity(2 + name.len());
    write_u16(&mut payload, QUALIFIER_SAVE_PERMANENT)?;
    payload.extend_from_slice(name.as_bytes());
    let mut blocks = Vec::new();
    push_block(
        &mut blocks,
        OPTION_DEVICE_PROPERTIES,
        SUBOPTION_NAME_OF_STATION,
        &payload,
    )?;
    dcp_frame(
        dst_mac,
        src_mac,
        DCP_GET_SET_FRAME_ID,
        DcpServiceId::Set,
        xid,
        0,
        &blocks,
    )
}

/// Parse a PROFINET frame into a DCP PDU the controller cares about. `payload` is the bytes
/// after the EtherType, `src_mac` the Ethernet source. Returns `Ok(None)` for DCP requests and
/// frame ids outside DCP.
pub fn parse_dcp(src_mac: [u8; 6], payload: &[u8]) -> EncodingResult<Option<DcpFrame>> {
    let mut stream = Cursor::new(payload);
    let frame_id = read_u16(&mut stream)?;
    if frame_id != DCP_IDENTIFY_FRAME_ID
        && frame_id != DCP_IDENTIFY_RESPONSE_FRAME_ID
        && frame_id != DCP_GET_SET_FRAME_ID
    {
        return Ok(None);
    }
    let service_id = read_u8(&mut stream)?;
    let service_type = read_u8(&mut stream)?;
    if service_type & DCP_SERVICE_TYPE_RESPONSE == 0 {
        // Requests from other controllers are none of our business.
        return Ok(None);
    }
    let xid = read_u32(&mut stream)?;
    // ResponseDelay in requests, reserved in responses.
    let _ = read_u16(&mut stream)?;
    let data_length = read_u16(&mut stream)? as usize;
    let mut blocks = vec![0u8; data_length];
    read_bytes(&mut stream, &mut blocks)?;

    match service_id {
        x if x == DcpServiceId::Identify as u8 => {
            let device = parse_identify_blocks(src_mac, &blocks)?;
            Ok(Some(DcpFrame::IdentifyResponse { xid, device }))
        }
        x if x == DcpServiceId::Set as u8 => {
            let error = parse_set_blocks(&blocks)?;
            Ok(Some(DcpFrame::SetResponse { xid, error }))
        }
        _ => Ok(None),
    }
}

fn parse_identify_blocks(mac: [u8; 6], blocks: &[u8]) -> EncodingResult<DcpDevice> {
    let mut device = DcpDevice {
        mac,
        station_name: String::new(),
        ip: Ipv4Addr::UNSPECIFIED,
        netmask: Ipv4Addr::UNSPECIFIED,
        gateway: Ipv4Addr::UNSPECIFIED,
        vendor_id: 0,
        device_id: 0,
    };
    let mut stream = Cursor::new(blocks);
    while (stream.position() as usize) < blocks.len() {
        let offset = stream.position() as usize;
        let option = read_u8(&mut stream)?;
        let suboption = read_u8(&mut stream)?;
        let length = read_u16(&mut stream)? as usize;
        let mut payload = vec![0u8; length];
        read_bytes(&mut stream, &mut payload).map_err(|e| e.at_offset(offset))?;
        if length % 2 == 1 && (stream.position() as usize) < blocks.len() {
            let _ = read_u8(&mut stream)?;
        }

        match (option, suboption) {
            (OPTION_IP, SUBOPTION_IP_PARAMETER) if payload.len() >= 14 => {
                // BlockInfo, then address, netmask, gateway.
                device.ip = Ipv4Addr::new(payload[2], payload[3], payload[4], payload[5]);
                device.netmask = Ipv4Addr::new(payload[6], payload[7], payload[8], payload[9]);
                device.gateway = Ipv4Addr::new(payload[10], payload[11], payload[12], payload[13]);
            }
            (OPTION_DEVICE_PROPERTIES, SUBOPTION_NAME_OF_STATION) if payload.len() >= 2 => {
                device.station_name = String::from_utf8_lossy(&payload[2..]).into_owned();
            }
            (OPTION_DEVICE_PROPERTIES, SUBOPTION_DEVICE_ID) if payload.len() >= 6 => {
                device.vendor_id = u16::from_be_bytes([payload[2], payload[3]]);
                device.device_id = u16::from_be_bytes([payload[4], payload[5]]);
            }
            _ => {}
        }
    }
    Ok(device)
}

fn parse_set_blocks(blocks: &[u8]) -> EncodingResult<u8> {
    let mut stream = Cursor::new(blocks);
    while (stream.position() as usize) < blocks.len() {
        let option = read_u8(&mut stream)?;
        let suboption = read_u8(&mut stream)?;
        let length = read_u16(&mut stream)? as usize;
        let mut payload = vec![0u8; length];
        read_bytes(&mut stream, &mut payload)?;
        if length % 2 == 1 && (stream.position() as usize) < blocks.len() {
            let _ = read_u8(&mut stream)?;
        }
        if option == OPTION_CONTROL && suboption == SUBOPTION_CONTROL_RESPONSE && payload.len() >= 3
        {
            return Ok(payload[2]);
        }
    }
    Err(Error::invalid_length(
        "set response carried no control block",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ethernet::ETHERNET_HEADER_LEN;

    const SRC: [u8; 6] = [0x02, 0x00, 0x00, 0xAA, 0xBB, 0xCC];
    const DEV: [u8; 6] = [0x00, 0x30, 0x11, 0x02, 0x03, 0x04];

    #[test]
    fn identify_all_layout() {
        let frame = build_identify_all(SRC, 0x1001).unwrap();
        assert_eq!(&frame[0..6], &DCP_IDENTIFY_MULTICAST);
        assert_eq!(&frame[6..12], &SRC);
        assert_eq!(&frame[12..14], &[0x88, 0x92]);
        assert_eq!(&frame[14..16], &[0xFE, 0xFE]);
        // ServiceID Identify, ServiceType request.
        assert_eq!(frame[16], 5);
        assert_eq!(frame[17], 0);
        // Xid.
        assert_eq!(&frame[18..22], &[0x00, 0x00, 0x10, 0x01]);
        // AllSelector block.
        assert_eq!(&frame[26..30], &[0xFF, 0xFF, 0x00, 0x00]);
    }

    fn identify_response_payload(xid: u32, name: &str, ip: [u8; 4]) -> Vec<u8> {
        let mut blocks = Vec::new();
        // NameOfStation with BlockInfo 0.
        let mut name_payload = vec![0, 0];
        name_payload.extend_from_slice(name.as_bytes());
        push_block(
            &mut blocks,
            OPTION_DEVICE_PROPERTIES,
            SUBOPTION_NAME_OF_STATION,
            &name_payload,
        )
        .unwrap();
        // DeviceID.
        push_block(
            &mut blocks,
            OPTION_DEVICE_PROPERTIES,
            SUBOPTION_DEVICE_ID,
            &[0, 0, 0x01, 0x7B, 0x00, 0x02],
        )
        .unwrap();
        // IP parameter.
        let mut ip_payload = vec![0, 1];
        ip_payload.extend_from_slice(&ip);
        ip_payload.extend_from_slice(&[255, 255, 255, 0]);
        ip_payload.extend_from_slice(&[0, 0, 0, 0]);
        push_block(&mut blocks, OPTION_IP, SUBOPTION_IP_PARAMETER, &ip_payload).unwrap();

        let mut payload = Vec::new();
        write_u16(&mut payload, DCP_IDENTIFY_RESPONSE_FRAME_ID).unwrap();
        write_u8(&mut payload, DcpServiceId::Identify as u8).unwrap();
        write_u8(&mut payload, DCP_SERVICE_TYPE_RESPONSE).unwrap();
        write_u32(&mut payload, xid).unwrap();
        write_u16(&mut payload, 0).unwrap();
        write_u16(&mut payload, blocks.len() as u16).unwrap();
        payload.extend_from_slice(&blocks);
        payload
    }

    #[test]
    fn identify_response_parses() {
        let payload = identify_response_payload(7, "wtc-rtu-01", [192, 0, 2, 20]);
        let parsed = parse_dcp(DEV, &payload).unwrap().unwrap();
        match parsed {
            DcpFrame::IdentifyResponse { xid, device } => {
                assert_eq!(xid, 7);
                assert_eq!(device.mac, DEV);
                assert_eq!(device.station_name, "wtc-rtu-01");
                assert_eq!(device.ip, Ipv4Addr::new(192, 0, 2, 20));
                assert_eq!(device.vendor_id, 0x017B);
                assert_eq!(device.device_id, 2);
                assert!(!device.needs_ip());
            }
            other => panic!("unexpected parse {other:?}"),
        }
    }

    #[test]
    fn unconfigured_device_needs_ip() {
        let payload = identify_response_payload(8, "", [0, 0, 0, 0]);
        let parsed = parse_dcp(DEV, &payload).unwrap().unwrap();
        match parsed {
            DcpFrame::IdentifyResponse { device, .. } => assert!(device.needs_ip()),
            other => panic!("unexpected parse {other:?}"),
        }
    }

    #[test]
    fn set_ip_round_trip_through_parse() {
        let frame = build_set_ip(
            SRC,
            DEV,
            9,
            Ipv4Addr::new(192, 0, 2, 20),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::UNSPECIFIED,
        )
        .unwrap();
        // Requests are ignored by the parser, only responses matter.
        assert_eq!(
            parse_dcp(SRC, &frame[ETHERNET_HEADER_LEN..]).unwrap(),
            None
        );
    }

    #[test]
    fn set_response_error_byte() {
        let mut blocks = Vec::new();
        push_block(
            &mut blocks,
            OPTION_CONTROL,
            SUBOPTION_CONTROL_RESPONSE,
            &[OPTION_IP, SUBOPTION_IP_PARAMETER, 0],
        )
        .unwrap();
        let mut payload = Vec::new();
        write_u16(&mut payload, DCP_GET_SET_FRAME_ID).unwrap();
        write_u8(&mut payload, DcpServiceId::Set as u8).unwrap();
        write_u8(&mut payload, DCP_SERVICE_TYPE_RESPONSE).unwrap();
        write_u32(&mut payload, 9).unwrap();
        write_u16(&mut payload, 0).unwrap();
        write_u16(&mut payload, blocks.len() as u16).unwrap();
        payload.extend_from_slice(&blocks);

        let parsed = parse_dcp(DEV, &payload).unwrap().unwrap();
        assert_eq!(parsed, DcpFrame::SetResponse { xid: 9, error: 0 });
    }
}
