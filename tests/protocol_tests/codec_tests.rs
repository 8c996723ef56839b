//! Codec Tests
//!
//! Tests for frame and response encoding/decoding.

use std::io::Cursor;

use cradlekv::protocol::{
    decode_frame, decode_response, encode_frame, encode_response, read_frame, read_response,
    write_frame, write_response, AdminCommand, Frame, FrameKind, ListFilter, Operation, Payload,
    Request, Response, Status, HEADER_SIZE, MAX_KEY_SIZE, MAX_PAYLOAD_SIZE,
};
use cradlekv::storage::Record;
use cradlekv::{CradleError, Directory, KeyRange, Owner};

// =============================================================================
// Frame Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_request_keeps_hop_count() {
    let request = Request::put("user:1", "alice").with_hops(2);
    let decoded = decode_frame(&encode_frame(&Frame::Request(request.clone())).unwrap()).unwrap();

    match decoded {
        Frame::Request(got) => {
            assert_eq!(got, request);
            assert_eq!(got.hop_count, 2);
        }
        other => panic!("Expected REQUEST frame, got {:?}", other),
    }
}

#[test]
fn test_list_filter_survives_the_wire() {
    let filter = ListFilter::prefix("user:").with_end("user:5").with_limit(10);
    let encoded = encode_frame(&Frame::Request(Request::list("user:", filter.clone()))).unwrap();

    match decode_frame(&encoded).unwrap() {
        Frame::Request(got) => assert_eq!(got.filter, Some(filter)),
        other => panic!("Expected REQUEST frame, got {:?}", other),
    }
}

#[test]
fn test_admin_frame() {
    let command = AdminCommand::CreateNode {
        name: "r1".to_string(),
        range: KeyRange::new(b"a".to_vec(), Some(b"m".to_vec())),
    };
    let encoded = encode_frame(&Frame::Admin(command.clone())).unwrap();
    assert_eq!(encoded[0], FrameKind::Admin as u8);
    assert_eq!(decode_frame(&encoded).unwrap(), Frame::Admin(command));
}

#[test]
fn test_empty_frames_have_no_body() {
    for frame in [Frame::Ping, Frame::Directory] {
        let encoded = encode_frame(&frame).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }
}

#[test]
fn test_empty_key_is_allowed() {
    let encoded = encode_frame(&Frame::Request(Request::get(""))).unwrap();
    assert!(matches!(decode_frame(&encoded).unwrap(), Frame::Request(r) if r.key.is_empty()));
}

// =============================================================================
// Malformed Input Tests
// =============================================================================

#[test]
fn test_unknown_frame_kind() {
    let bytes = [0x7f, 0, 0, 0, 0];
    assert!(matches!(decode_frame(&bytes), Err(CradleError::Protocol(_))));
}

#[test]
fn test_garbage_body_is_malformed() {
    let mut bytes = vec![FrameKind::Request as u8, 0, 0, 0, 3];
    bytes.extend_from_slice(&[0xff, 0xff, 0xff]);
    assert!(matches!(
        decode_frame(&bytes),
        Err(CradleError::MalformedRequest(_))
    ));
}

#[test]
fn test_ping_with_body_is_malformed() {
    let bytes = [FrameKind::Ping as u8, 0, 0, 0, 1, 0x00];
    assert!(matches!(
        decode_frame(&bytes),
        Err(CradleError::MalformedRequest(_))
    ));
}

#[test]
fn test_put_without_value_is_malformed() {
    let mut request = Request::put("k", "v");
    request.value = None;
    let encoded = encode_frame(&Frame::Request(request)).unwrap();
    assert!(matches!(
        decode_frame(&encoded),
        Err(CradleError::MalformedRequest(_))
    ));
}

#[test]
fn test_oversized_key_is_malformed() {
    let request = Request::get(vec![b'k'; MAX_KEY_SIZE + 1]);
    let encoded = encode_frame(&Frame::Request(request)).unwrap();
    assert!(matches!(
        decode_frame(&encoded),
        Err(CradleError::MalformedRequest(_))
    ));
}

#[test]
fn test_oversized_length_is_rejected() {
    let len = (MAX_PAYLOAD_SIZE + 1).to_be_bytes();
    let bytes = [FrameKind::Request as u8, len[0], len[1], len[2], len[3]];
    assert!(matches!(decode_frame(&bytes), Err(CradleError::Protocol(_))));
}

#[test]
fn test_incomplete_frames() {
    assert!(decode_frame(&[FrameKind::Ping as u8, 0]).is_err());

    let encoded = encode_frame(&Frame::Request(Request::get("key"))).unwrap();
    assert!(decode_frame(&encoded[..encoded.len() - 1]).is_err());
}

// =============================================================================
// Response Tests
// =============================================================================

#[test]
fn test_records_response() {
    let records = vec![
        Record {
            key: b"a".to_vec(),
            value: b"1".to_vec(),
            version: 1,
        },
        Record {
            key: b"b".to_vec(),
            value: b"2".to_vec(),
            version: 2,
        },
    ];
    let response = Response::records(records.clone(), Some(b"g".to_vec()));
    let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();

    assert_eq!(decoded.status, Status::Ok);
    assert_eq!(
        decoded.payload,
        Some(Payload::Records {
            records,
            resume: Some(b"g".to_vec())
        })
    );
}

#[test]
fn test_directory_response() {
    let directory = Directory::new("h1")
        .assign(
            &KeyRange::new(b"a".to_vec(), Some(b"m".to_vec())),
            Owner::new("r1", "h1"),
        )
        .unwrap();
    let response = Response::ok(Some(Payload::Directory(directory.clone())));
    let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();
    assert_eq!(decoded.payload, Some(Payload::Directory(directory)));
}

#[test]
fn test_error_statuses_round_trip_through_into_result() {
    let response = Response::from_error(&CradleError::RoutingLoop { hops: 4, bound: 3 });
    let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();

    match decoded.into_result() {
        Err(CradleError::Remote { status, message }) => {
            assert_eq!(status, Status::RoutingLoop);
            assert!(message.contains('4'));
        }
        other => panic!("Expected remote RoutingLoop, got {:?}", other),
    }
}

#[test]
fn test_not_found_has_no_payload() {
    let encoded = encode_response(&Response::not_found()).unwrap();
    assert_eq!(encoded.len(), HEADER_SIZE);
    assert!(matches!(
        decode_response(&encoded).unwrap().into_result(),
        Err(CradleError::NotFound)
    ));
}

#[test]
fn test_unknown_status_byte() {
    assert!(decode_response(&[0x42, 0, 0, 0, 0]).is_err());
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[test]
fn test_stream_carries_several_frames() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &Frame::Request(Request::put("k", "v"))).unwrap();
    write_frame(&mut buffer, &Frame::Ping).unwrap();
    write_frame(&mut buffer, &Frame::Request(Request::get("k"))).unwrap();

    let mut cursor = Cursor::new(buffer);
    assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::Request(r) if r.op == Operation::Put));
    assert_eq!(read_frame(&mut cursor).unwrap(), Frame::Ping);
    assert!(matches!(read_frame(&mut cursor).unwrap(), Frame::Request(r) if r.op == Operation::Get));
    assert!(matches!(read_frame(&mut cursor), Err(CradleError::Io(_))));
}

#[test]
fn test_stream_stays_in_sync_after_malformed_body() {
    let mut buffer = vec![FrameKind::Request as u8, 0, 0, 0, 2, 0xff, 0xff];
    write_frame(&mut buffer, &Frame::Ping).unwrap();

    let mut cursor = Cursor::new(buffer);
    assert!(matches!(
        read_frame(&mut cursor),
        Err(CradleError::MalformedRequest(_))
    ));
    assert_eq!(read_frame(&mut cursor).unwrap(), Frame::Ping);
}

#[test]
fn test_stream_response() {
    let mut buffer = Vec::new();
    write_response(&mut buffer, &Response::value(b"alice".to_vec())).unwrap();

    let mut cursor = Cursor::new(buffer);
    let response = read_response(&mut cursor).unwrap();
    assert_eq!(response.payload, Some(Payload::Value(b"alice".to_vec())));
}
