// PROFINET for Rust
// SPDX-License-Identifier: MPL-2.0

//! The cyclic RT frame codec: FrameID, C_SDU and the APDU trailer.
//!
//! A cyclic frame's payload is `FrameID (u16) | C_SDU | CycleCounter (u16) | DataStatus (u8) |
//! TransferStatus (u8)`. The C_SDU is the per-submodule IO data with its IOPS/IOCS bytes, laid
//! out by the session's frame layout.

use profinet_types::constants::{RT_FRAME_ID_MAX, RT_FRAME_ID_MIN};

use crate::ethernet::EthernetHeader;
use profinet_types::BinaryEncodable;

/// CycleCounter, DataStatus and TransferStatus.
pub const RT_TRAILER_LEN: usize = 4;

/// Minimum C_SDU length; shorter IO data is zero-padded up to this.
pub const RT_MIN_CSDU_LEN: usize = 40;

/// DataStatus: frame is from the primary interface.
pub const DATA_STATUS_STATE_PRIMARY: u8 = 0x01;
/// DataStatus: provider data is valid.
pub const DATA_STATUS_DATA_VALID: u8 = 0x04;
/// DataStatus: provider is in RUN.
pub const DATA_STATUS_PROVIDER_RUN: u8 = 0x10;
/// DataStatus: no station problem indicated.
pub const DATA_STATUS_NO_PROBLEM: u8 = 0x20;

/// The DataStatus a healthy running provider stamps.
pub const DATA_STATUS_GOOD: u8 = DATA_STATUS_STATE_PRIMARY
    | DATA_STATUS_DATA_VALID
    | DATA_STATUS_PROVIDER_RUN
    | DATA_STATUS_NO_PROBLEM;

/// A received cyclic frame, borrowed out of the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtFrame<'a> {
    /// FrameID stamped by the producer.
    pub frame_id: u16,
    /// The C_SDU: IO data and status bytes.
    pub data: &'a [u8],
    /// Wrapping counter the producer increments every cycle.
    pub cycle_counter: u16,
    /// Producer's DataStatus.
    pub data_status: u8,
    /// Always 0 unless the producer is faulted.
    pub transfer_status: u8,
}

/// Assemble a complete cyclic Ethernet frame.
pub fn build_rt_frame(
    dst: [u8; 6],
    src: [u8; 6],
    frame_id: u16,
    io_data: &[u8],
    cycle_counter: u16,
    data_status: u8,
) -> Vec<u8> {
    let csdu_len = io_data.len().max(RT_MIN_CSDU_LEN);
    let mut frame = Vec::with_capacity(14 + 2 + csdu_len + RT_TRAILER_LEN);
    // Header encode onto a Vec cannot fail.
    let _ = EthernetHeader::new(dst, src).encode(&mut frame);
    frame.extend_from_slice(&frame_id.to_be_bytes());
    frame.extend_from_slice(io_data);
    frame.resize(14 + 2 + csdu_len, 0);
    frame.extend_from_slice(&cycle_counter.to_be_bytes());
    frame.push(data_status);
    frame.push(0); // transfer status
    frame
}

/// Parse the PROFINET payload (bytes after the EtherType) of a cyclic frame. Returns `None`
/// for FrameIDs outside the real-time range, `Some` with the C_SDU still carrying any minimum
/// padding the producer added.
pub fn parse_rt_frame(payload: &[u8]) -> Option<RtFrame<'_>> {
    if payload.len() < 2 + RT_TRAILER_LEN {
        return None;
    }
    let frame_id = u16::from_be_bytes([payload[0], payload[1]]);
    if !(RT_FRAME_ID_MIN..=RT_FRAME_ID_MAX).contains(&frame_id) {
        return None;
    }
    let trailer = payload.len() - RT_TRAILER_LEN;
    Some(RtFrame {
        frame_id,
        data: &payload[2..trailer],
        cycle_counter: u16::from_be_bytes([payload[trailer], payload[trailer + 1]]),
        data_status: payload[trailer + 2],
        transfer_status: payload[trailer + 3],
    })
}

/// `true` when `current` is a later cycle than `previous`, accounting for wrap. A frame whose
/// counter has not advanced is stale and must be ignored.
pub fn cycle_counter_advanced(previous: u16, current: u16) -> bool {
    let delta = current.wrapping_sub(previous);
    delta != 0 && delta < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let io_data = [0x41u8, 0xC8, 0x00, 0x00, 0x00, 0x80];
        let frame = build_rt_frame(
            [1, 2, 3, 4, 5, 6],
            [7, 8, 9, 10, 11, 12],
            0xC001,
            &io_data,
            77,
            DATA_STATUS_GOOD,
        );
        let parsed = parse_rt_frame(&frame[14..]).unwrap();
        assert_eq!(parsed.frame_id, 0xC001);
        assert_eq!(&parsed.data[..io_data.len()], &io_data);
        assert_eq!(parsed.data.len(), RT_MIN_CSDU_LEN);
        assert_eq!(parsed.cycle_counter, 77);
        assert_eq!(parsed.data_status, DATA_STATUS_GOOD);
        assert_eq!(parsed.transfer_status, 0);
    }

    #[test]
    fn short_io_data_is_padded_to_minimum() {
        let frame = build_rt_frame([0; 6], [0; 6], 0x0100, &[1, 2, 3], 0, DATA_STATUS_GOOD);
        // 14 ethernet + 2 frame id + 40 C_SDU + 4 trailer.
        assert_eq!(frame.len(), 60);
    }

    #[test]
    fn non_rt_frame_ids_are_ignored() {
        let frame = build_rt_frame([0; 6], [0; 6], 0x0100, &[0; 40], 0, 0);
        let mut payload = frame[14..].to_vec();
        payload[0] = 0xFE;
        payload[1] = 0xFE; // DCP identify, not RT
        assert!(parse_rt_frame(&payload).is_none());
    }

    #[test]
    fn cycle_counter_wraps() {
        assert!(cycle_counter_advanced(10, 11));
        assert!(cycle_counter_advanced(0xFFFF, 0));
        assert!(!cycle_counter_advanced(11, 11));
        assert!(!cycle_counter_advanced(11, 10));
        assert!(!cycle_counter_advanced(0, 0xFFFF));
    }
}
