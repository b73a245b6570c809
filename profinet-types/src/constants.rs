// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! Wire-level constants shared across the stack.

/// EtherType carried by all PROFINET Layer 2 traffic, DCP and cyclic RT alike.
pub const PROFINET_ETHERTYPE: u16 = 0x8892;

/// EtherType of an 802.1Q VLAN tag, which may precede the PROFINET EtherType.
pub const VLAN_ETHERTYPE: u16 = 0x8100;

/// Destination MAC of the DCP Identify multicast.
pub const DCP_IDENTIFY_MULTICAST: [u8; 6] = [0x01, 0x0E, 0xCF, 0x00, 0x00, 0x00];

/// UDP port the device-side connection manager listens on for RPC.
pub const PNIO_UDP_PORT: u16 = 34964;

/// Lowest FrameID of the cyclic real-time range.
pub const RT_FRAME_ID_MIN: u16 = 0x0100;

/// Highest FrameID of the cyclic real-time range.
pub const RT_FRAME_ID_MAX: u16 = 0xFBFF;

/// FrameID of a DCP Identify request (multicast).
pub const DCP_IDENTIFY_FRAME_ID: u16 = 0xFEFE;

/// FrameID of DCP Identify responses (unicast).
pub const DCP_IDENTIFY_RESPONSE_FRAME_ID: u16 = 0xFEFF;

/// FrameID of DCP Get/Set requests and responses (unicast).
pub const DCP_GET_SET_FRAME_ID: u16 = 0xFEFD;

/// VLAN tag carried inside the IOCRTagHeader: priority 6, VID 0. Encoding 0x0000 here makes
/// conformant device stacks silently drop the CR.
pub const IOCR_VLAN_TAG: u16 = 0xC000;

/// SendClockFactor for a 31.25 us base clock giving a 1 ms send clock.
pub const SEND_CLOCK_FACTOR_1MS: u16 = 32;

/// Maximum RTA timeout factor permitted in an AlarmCRBlockReq.
pub const RTA_TIMEOUT_FACTOR_MAX: u16 = 100;

/// Maximum length in bytes of a station name.
pub const MAX_STATION_NAME_LEN: usize = 64;

/// Size on the wire of one analog sensor value: float32 plus one quality byte.
pub const SENSOR_WIRE_LEN: usize = 5;

/// Size on the wire of one actuator output: command, duty and two reserved bytes.
pub const ACTUATOR_WIRE_LEN: usize = 4;

/// IOPS/IOCS code for valid data.
pub const IOXS_GOOD: u8 = 0x80;

/// IOPS/IOCS code for invalid data.
pub const IOXS_BAD: u8 = 0x00;

/// Fixed boxcar storage ceiling: a sample is stored at least this often.
pub const BOXCAR_INTERVAL_MS: u64 = 60_000;
