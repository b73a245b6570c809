use crate::blocks::*;
use crate::{BinaryDecodable, BinaryEncodable, PnUuid};

fn connect_blocks() -> (ArBlockReq, IocrBlockReq, IocrBlockReq, AlarmCrBlockReq) {
    let ar = ArBlockReq {
        ar_type: AR_TYPE_IOCAR_SINGLE,
        ar_uuid: PnUuid::from_bytes([0x42; 16]),
        session_key: 1,
        cm_initiator_mac: [0x02, 0x00, 0x00, 0x01, 0x02, 0x03],
        cm_initiator_object_uuid: PnUuid::from_bytes([0x17; 16]),
        ar_properties: ArProperties::STATE_ACTIVE | ArProperties::STARTUP_MODE_ADVANCED,
        cm_initiator_activity_timeout_factor: 600,
        cm_initiator_udp_rt_port: 0x8892,
        cm_initiator_station_name: "wtc-controller".to_string(),
    };
    let input = IocrBlockReq::new_rt_class_1(
        IocrType::Input,
        1,
        0xC001,
        12,
        32,
        32,
        3,
        vec![IocrApi {
            api: 0,
            io_data_objects: vec![IocrIoDataObject {
                slot: 1,
                subslot: 1,
                frame_offset: 0,
            }],
            iocs: vec![IocrCs {
                slot: 0,
                subslot: 1,
                frame_offset: 6,
            }],
        }],
    );
    let output = IocrBlockReq::new_rt_class_1(
        IocrType::Output,
        2,
        0xC000,
        8,
        32,
        32,
        3,
        vec![IocrApi {
            api: 0,
            io_data_objects: vec![IocrIoDataObject {
                slot: 2,
                subslot: 1,
                frame_offset: 0,
            }],
            iocs: vec![IocrCs {
                slot: 0,
                subslot: 1,
                frame_offset: 5,
            }],
        }],
    );
    (ar, input, output, AlarmCrBlockReq::default())
}

#[test]
fn blocks_concatenate_without_padding() {
    let (ar, input, output, alarm) = connect_blocks();
    let mut payload = Vec::new();
    ar.encode(&mut payload).unwrap();
    input.encode(&mut payload).unwrap();
    output.encode(&mut payload).unwrap();
    alarm.encode(&mut payload).unwrap();
    assert_eq!(
        payload.len(),
        ar.byte_len() + input.byte_len() + output.byte_len() + alarm.byte_len()
    );

    // The decoders must consume exactly their block and leave the stream at the next one.
    let mut stream = payload.as_slice();
    assert_eq!(ArBlockReq::decode(&mut stream).unwrap(), ar);
    assert_eq!(IocrBlockReq::decode(&mut stream).unwrap(), input);
    assert_eq!(IocrBlockReq::decode(&mut stream).unwrap(), output);
    assert_eq!(AlarmCrBlockReq::decode(&mut stream).unwrap(), alarm);
    assert!(stream.is_empty());
}

#[test]
fn truncated_block_is_an_error_not_a_panic() {
    let (ar, ..) = connect_blocks();
    let bytes = ar.encode_to_vec();
    for len in 0..bytes.len() {
        assert!(ArBlockReq::decode(&mut &bytes[..len]).is_err());
    }
}

#[test]
fn block_length_counts_version_but_not_type_and_length() {
    let (_, _, _, alarm) = connect_blocks();
    let bytes = alarm.encode_to_vec();
    let announced = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    // Total = type (2) + length (2) + announced.
    assert_eq!(bytes.len(), 4 + announced);
}
