//! The AR establishment sequence: Connect, PrmEnd, ApplicationReady, and acyclic record
//! access, expressed over the RPC engine.

use std::io::Cursor;
use std::time::Duration;

use log::warn;

use profinet_core::rpc::{Opnum, RpcClient};
use profinet_types::{
    blocks::{
        AlarmCrBlockReq, AlarmCrBlockRes, ArBlockReq, ArBlockRes, ArProperties, BlockHeader,
        BlockType, ControlBlock, ControlCommand, DataDescription, DataDirection, ExpectedSubmodule,
        ExpectedSubmoduleBlockReq, IocrApi, IocrBlockReq, IocrBlockRes, IocrCs, IocrIoDataObject,
        IocrType, IodReadReqHeader, IodReadResHeader, IodWriteReqHeader, IodWriteResHeader,
        SubmoduleType, AR_TYPE_IOCAR_SINGLE,
    },
    constants::{PROFINET_ETHERTYPE, SEND_CLOCK_FACTOR_1MS},
    skip_bytes, BinaryDecodable, BinaryEncodable,
};

use super::{session_debug, session_trace, session_warn, ArSession, SessionError};
use crate::rtu::{SlotConfig, SlotKind};

/// I&M0 identification and maintenance record.
pub const IM0_RECORD_INDEX: u16 = 0xAFF0;

/// CMInitiatorActivityTimeoutFactor in 100 ms units: 60 s.
const ACTIVITY_TIMEOUT_FACTOR: u16 = 600;

/// Who we claim to be in the ARBlockReq.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    /// The controller's own station name.
    pub station_name: String,
    /// The controller's MAC on the session's interface.
    pub mac: [u8; 6],
}

fn iocr_api(layout: &super::FrameLayout) -> IocrApi {
    IocrApi {
        api: 0,
        io_data_objects: layout
            .entries
            .iter()
            .map(|e| IocrIoDataObject {
                slot: e.slot,
                subslot: e.subslot,
                frame_offset: e.data_offset as u16,
            })
            .collect(),
        iocs: layout
            .consumer_statuses
            .iter()
            .map(|cs| IocrCs {
                slot: cs.slot,
                subslot: cs.subslot,
                frame_offset: cs.offset as u16,
            })
            .collect(),
    }
}

fn expected_blocks(
    slots: &[SlotConfig],
) -> Vec<ExpectedSubmoduleBlockReq> {
    slots
        .iter()
        .filter(|s| s.enabled)
        .map(|slot| {
            let (submodule_type, descriptions) = match slot.kind {
                SlotKind::Dap => (
                    SubmoduleType::NoIo,
                    vec![DataDescription::no_io(DataDirection::Input)],
                ),
                SlotKind::Sensor => (
                    SubmoduleType::Input,
                    vec![DataDescription {
                        direction: DataDirection::Input,
                        length_io_data: slot.wire_len() as u16,
                        length_iops: 1,
                        length_iocs: 1,
                    }],
                ),
                SlotKind::Actuator => (
                    SubmoduleType::Output,
                    vec![DataDescription {
                        direction: DataDirection::Output,
                        length_io_data: slot.wire_len() as u16,
                        length_iops: 1,
                        length_iocs: 1,
                    }],
                ),
            };
            ExpectedSubmoduleBlockReq::single(
                slot.slot,
                slot.module_ident,
                vec![ExpectedSubmodule {
                    subslot: slot.subslot,
                    submodule_ident: slot.submodule_ident,
                    submodule_properties: submodule_type as u16,
                    data_descriptions: descriptions,
                }],
            )
        })
        .collect()
}

/// Assemble the Connect request payload: ARBlockReq, both IOCRs, AlarmCR, then one
/// ExpectedSubmoduleBlockReq per configured slot, concatenated without padding.
pub fn build_connect_request(
    session: &ArSession,
    slots: &[SlotConfig],
    local: &LocalIdentity,
) -> Result<Vec<u8>, SessionError> {
    let ar = ArBlockReq {
        ar_type: AR_TYPE_IOCAR_SINGLE,
        ar_uuid: session.ar_uuid,
        session_key: session.session_key,
        cm_initiator_mac: local.mac,
        cm_initiator_object_uuid: session.ar_uuid,
        ar_properties: ArProperties::STATE_ACTIVE | ArProperties::SUPERVISOR_TAKEOVER_ALLOWED,
        cm_initiator_activity_timeout_factor: ACTIVITY_TIMEOUT_FACTOR,
        cm_initiator_udp_rt_port: PROFINET_ETHERTYPE,
        cm_initiator_station_name: local.station_name.clone(),
    };

    let input = IocrBlockReq::new_rt_class_1(
        IocrType::Input,
        1,
        session.input_frame_id,
        session.input_layout.total_len.max(40) as u16,
        SEND_CLOCK_FACTOR_1MS,
        session.reduction_ratio,
        session.watchdog_factor,
        vec![iocr_api(&session.input_layout)],
    );
    let output = IocrBlockReq::new_rt_class_1(
        IocrType::Output,
        2,
        session.output_frame_id,
        session.output_layout.total_len.max(40) as u16,
        SEND_CLOCK_FACTOR_1MS,
        session.reduction_ratio,
        session.watchdog_factor,
        vec![iocr_api(&session.output_layout)],
    );

    let mut payload = Vec::new();
    ar.encode(&mut payload)?;
    input.encode(&mut payload)?;
    output.encode(&mut payload)?;
    AlarmCrBlockReq::default().encode(&mut payload)?;
    for block in expected_blocks(slots) {
        block.encode(&mut payload)?;
    }
    Ok(payload)
}

fn peek_block_type(body: &[u8], pos: usize) -> Option<u16> {
    body.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

/// Execute the Connect call and absorb its response blocks into the session: the device may
/// move the input FrameID, and a ModuleDiffBlock means the plugged modules disagree with the
/// expectation.
pub async fn connect(
    rpc: &mut RpcClient,
    session: &mut ArSession,
    slots: &[SlotConfig],
    local: &LocalIdentity,
) -> Result<(), SessionError> {
    let payload = build_connect_request(session, slots, local)?;
    session_debug!(session, "connect to {} ({} bytes)", session.remote, payload.len());
    let body = rpc.call(Opnum::Connect, &payload).await?;

    let mut cursor = Cursor::new(body.as_slice());
    let mut saw_ar_res = false;
    while (cursor.position() as usize) < body.len() {
        let pos = cursor.position() as usize;
        match peek_block_type(&body, pos) {
            Some(t) if t == BlockType::ArBlockRes as u16 => {
                let res = ArBlockRes::decode(&mut cursor)?;
                if res.ar_uuid != session.ar_uuid {
                    return Err(SessionError::Protocol(format!(
                        "ARBlockRes for foreign AR {}",
                        res.ar_uuid
                    )));
                }
                session.remote_mac = res.cm_responder_mac;
                saw_ar_res = true;
            }
            Some(t) if t == BlockType::IocrBlockRes as u16 => {
                let res = IocrBlockRes::decode(&mut cursor)?;
                if res.iocr_type == IocrType::Input {
                    session_trace!(session, "device assigned input frame id {:#06X}", res.frame_id);
                    session.input_frame_id = res.frame_id;
                }
            }
            Some(t) if t == BlockType::AlarmCrBlockRes as u16 => {
                let _ = AlarmCrBlockRes::decode(&mut cursor)?;
            }
            Some(t) if t == BlockType::ModuleDiffBlock as u16 => {
                let header = BlockHeader::decode(&mut cursor)?;
                skip_bytes(&mut cursor, header.body_len() as u64)?;
                session_warn!(
                    session,
                    "device reports module differences, continuing with its layout"
                );
            }
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected block {other:?} at offset {pos} in connect response"
                )));
            }
        }
    }
    if !saw_ar_res {
        return Err(SessionError::Protocol(
            "connect response carried no ARBlockRes".to_string(),
        ));
    }
    Ok(())
}

/// Signal end of parameterisation and await the device's control acknowledgement.
pub async fn prm_end(rpc: &mut RpcClient, session: &ArSession) -> Result<(), SessionError> {
    let block = ControlBlock::prm_end(session.ar_uuid, session.session_key);
    let body = rpc.call(Opnum::Control, &block.encode_to_vec()).await?;
    let res = ControlBlock::decode(&mut body.as_slice())?;
    if res.control_command != ControlCommand::Done {
        return Err(SessionError::Protocol(format!(
            "PrmEnd answered with {:?} instead of Done",
            res.control_command
        )));
    }
    session_debug!(session, "parameterisation complete");
    Ok(())
}

/// Wait for the device's ApplicationReady request and answer it with an explicit
/// ApplicationReadyRes. Cyclic exchange may start once this returns.
pub async fn await_application_ready(
    rpc: &mut RpcClient,
    session: &ArSession,
    deadline: Duration,
) -> Result<(), SessionError> {
    let wait = async {
        loop {
            let (header, payload) = rpc.wait_for_request().await?;
            let block = match ControlBlock::decode(&mut payload.as_slice()) {
                Ok(b) => b,
                Err(e) => {
                    session_warn!(session, "undecodable device request ignored: {e}");
                    continue;
                }
            };
            if block.block_type != BlockType::IodControlApplicationReadyReq {
                session_trace!(session, "ignoring control block {:?}", block.block_type);
                continue;
            }
            if block.ar_uuid != session.ar_uuid {
                session_warn!(session, "ApplicationReady for foreign AR {}", block.ar_uuid);
                continue;
            }
            let ack =
                ControlBlock::application_ready_res(session.ar_uuid, session.session_key);
            rpc.send_response(&header, &ack.encode_to_vec()).await?;
            return Ok::<(), SessionError>(());
        }
    };
    match tokio::time::timeout(deadline, wait).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ApplicationReadyTimeout),
    }
}

/// Tear the AR down. Best effort on shutdown paths; the device drops the AR on watchdog
/// anyway.
pub async fn release(rpc: &mut RpcClient, session: &ArSession) -> Result<(), SessionError> {
    let block = ControlBlock::release(session.ar_uuid, session.session_key);
    let body = rpc.call(Opnum::Release, &block.encode_to_vec()).await?;
    let res = ControlBlock::decode(&mut body.as_slice())?;
    if res.control_command != ControlCommand::Done {
        return Err(SessionError::Protocol(format!(
            "Release answered with {:?} instead of Done",
            res.control_command
        )));
    }
    session_debug!(session, "released");
    Ok(())
}

/// Read an acyclic record.
pub async fn read_record(
    rpc: &mut RpcClient,
    session: &mut ArSession,
    api: u32,
    slot: u16,
    subslot: u16,
    index: u16,
    max_len: u32,
) -> Result<Vec<u8>, SessionError> {
    let header = IodReadReqHeader {
        seq_number: session.next_seq(),
        ar_uuid: session.ar_uuid,
        api,
        slot,
        subslot,
        index,
        record_data_length: max_len,
    };
    let body = rpc.call(Opnum::Read, &header.encode_to_vec()).await?;
    let mut cursor = Cursor::new(body.as_slice());
    let res = IodReadResHeader::decode(&mut cursor)?;
    let start = cursor.position() as usize;
    let end = start + res.record_data_length as usize;
    if end > body.len() {
        return Err(SessionError::Protocol(format!(
            "read response announces {} record bytes, {} present",
            res.record_data_length,
            body.len() - start
        )));
    }
    Ok(body[start..end].to_vec())
}

/// Write an acyclic record.
pub async fn write_record(
    rpc: &mut RpcClient,
    session: &mut ArSession,
    api: u32,
    slot: u16,
    subslot: u16,
    index: u16,
    data: &[u8],
) -> Result<(), SessionError> {
    let header = IodWriteReqHeader {
        seq_number: session.next_seq(),
        ar_uuid: session.ar_uuid,
        api,
        slot,
        subslot,
        index,
        record_data_length: data.len() as u32,
    };
    let mut payload = header.encode_to_vec();
    payload.extend_from_slice(data);
    let body = rpc.call(Opnum::Write, &payload).await?;
    let res = IodWriteResHeader::decode(&mut body.as_slice())?;
    if !res.status.is_ok() {
        return Err(SessionError::Pnio(res.status));
    }
    Ok(())
}

/// Try to read the device's I&M0 identification record. Plenty of stacks reject the I&M
/// indices, so a refusal is logged and swallowed rather than failing the session.
pub async fn read_identification(
    rpc: &mut RpcClient,
    session: &mut ArSession,
) -> Option<Vec<u8>> {
    match read_record(rpc, session, 0, 0, 1, IM0_RECORD_INDEX, 256).await {
        Ok(data) => Some(data),
        Err(e) => {
            warn!(
                "ar:{} I&M0 read rejected ({e}), continuing without identification data",
                session.id
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::session::SessionId;

    fn test_slots() -> Vec<SlotConfig> {
        let mut sensor = SlotConfig::dap(0x120, 0x121);
        sensor.slot = 1;
        sensor.kind = SlotKind::Sensor;
        let mut pump = SlotConfig::dap(0x220, 0x221);
        pump.slot = 2;
        pump.kind = SlotKind::Actuator;
        vec![SlotConfig::dap(0x10, 0x11), sensor, pump]
    }

    fn test_session() -> ArSession {
        ArSession::new(
            SessionId(1),
            "wtc-rtu-01".to_string(),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 20), 34964),
            [0xAA; 6],
            [0x02, 0, 0, 1, 2, 3],
            &test_slots(),
            32,
            3,
        )
    }

    #[test]
    fn connect_request_block_sequence() {
        let session = test_session();
        let local = LocalIdentity {
            station_name: "wtc-controller".to_string(),
            mac: session.local_mac,
        };
        let payload = build_connect_request(&session, &test_slots(), &local).unwrap();

        // Walk the block chain by announced lengths and collect the types.
        let mut types = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            let t = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            let len = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
            types.push(t);
            pos += 4 + len;
        }
        assert_eq!(pos, payload.len());
        assert_eq!(
            types,
            vec![0x0101, 0x0102, 0x0102, 0x0103, 0x0104, 0x0104, 0x0104]
        );
    }

    #[test]
    fn iocr_data_length_has_floor_of_40() {
        let session = test_session();
        // Input C_SDU here is 1 (DAP) + 6 (sensor) = 7 bytes, below the RT minimum.
        assert!(session.input_layout.total_len < 40);
        let local = LocalIdentity {
            station_name: "wtc-controller".to_string(),
            mac: session.local_mac,
        };
        let payload = build_connect_request(&session, &test_slots(), &local).unwrap();
        // Find the first IOCR block and check its DataLength field (offset 12 into the body).
        let mut pos = 0;
        loop {
            let t = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
            let len = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
            if t == 0x0102 {
                let data_length = u16::from_be_bytes([payload[pos + 16], payload[pos + 17]]);
                assert_eq!(data_length, 40);
                break;
            }
            pos += 4 + len;
        }
    }

    #[test]
    fn dap_description_is_no_io() {
        let blocks = expected_blocks(&test_slots());
        let dap = &blocks[0].apis[0];
        assert_eq!(dap.slot, 0);
        let desc = &dap.submodules[0].data_descriptions[0];
        assert_eq!(desc.length_io_data, 0);
        assert_eq!(desc.length_iops, 1);
        assert_eq!(desc.length_iocs, 1);
    }
}
