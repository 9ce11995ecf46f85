use super::*;

fn sample_frame() -> Frame {
    Frame::request(SHAPE_UPSERT, Data::new())
        .with_room_id(Uuid::new_v4())
        .with_from(Uuid::new_v4())
        .with_data(
            KEY_PAYLOAD,
            serde_json::json!({
                "id": "5f0c6a39-5a4e-4c43-9a7e-0c3f4c2f3a11",
                "kind": "rect",
                "attributes": {"x": 1.25, "fill": "#D94B4B", "tags": ["a", "b"], "nil": null},
                "updated_at": 1_700_000_000_123_i64
            }),
        )
}

#[test]
fn status_numeric_mapping_matches_wire_enum() {
    assert_eq!(Status::Request.as_i32(), 0);
    assert_eq!(Status::Done.as_i32(), 1);
    assert_eq!(Status::Error.as_i32(), 2);
}

#[test]
fn status_round_trips_from_wire_values() {
    assert_eq!(Status::from_i32(0).expect("status"), Status::Request);
    assert_eq!(Status::from_i32(1).expect("status"), Status::Done);
    assert_eq!(Status::from_i32(2).expect("status"), Status::Error);
}

#[test]
fn status_from_wire_rejects_out_of_range_value() {
    let err = Status::from_i32(99).expect_err("status should be invalid");
    assert!(matches!(err, CodecError::InvalidStatus(99)));
}

#[test]
fn terminal_statuses() {
    assert!(Status::Done.is_terminal());
    assert!(Status::Error.is_terminal());
    assert!(!Status::Request.is_terminal());
}

#[test]
fn encode_decode_round_trip_preserves_frame() {
    let frame = sample_frame();
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode should succeed");
    assert_eq!(decoded, frame);
}

#[test]
fn large_integers_survive_the_codec() {
    let frame = sample_frame();
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
    let ts = decoded.data[KEY_PAYLOAD]["updated_at"].as_i64();
    assert_eq!(ts, Some(1_700_000_000_123));
}

#[test]
fn decode_frame_rejects_malformed_bytes() {
    let err = decode_frame(&[0xff, 0x00, 0x01]).expect_err("bytes should fail");
    assert!(matches!(err, CodecError::Decode(_)));
}

#[test]
fn decode_frame_rejects_invalid_wire_status() {
    let wire = WireFrame {
        id: Uuid::new_v4().to_string(),
        parent_id: None,
        ts: 1,
        room_id: None,
        from: None,
        syscall: CHANNEL_PING.to_owned(),
        status: 77,
        data: None,
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");

    let err = decode_frame(&bytes).expect_err("status should fail");
    assert!(matches!(err, CodecError::InvalidStatus(77)));
}

#[test]
fn decode_frame_rejects_non_uuid_room() {
    let wire = WireFrame {
        id: Uuid::new_v4().to_string(),
        parent_id: None,
        ts: 1,
        room_id: Some("lobby".to_owned()),
        from: None,
        syscall: CHANNEL_JOIN.to_owned(),
        status: Status::Request.as_i32(),
        data: None,
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");

    let err = decode_frame(&bytes).expect_err("room id should fail");
    assert!(matches!(err, CodecError::InvalidUuid { field: "room_id", .. }));
}

#[test]
fn decode_frame_defaults_missing_data_to_empty_map() {
    let wire = WireFrame {
        id: Uuid::new_v4().to_string(),
        parent_id: None,
        ts: 1,
        room_id: None,
        from: None,
        syscall: CHANNEL_PING.to_owned(),
        status: Status::Request.as_i32(),
        data: None,
    };
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");

    let frame = decode_frame(&bytes).expect("decode");
    assert!(frame.data.is_empty());
}

#[test]
fn nan_numbers_decode_as_null() {
    assert_eq!(number_to_json(f64::NAN), Value::Null);
    assert_eq!(number_to_json(2.0), serde_json::json!(2));
    assert_eq!(number_to_json(0.5), serde_json::json!(0.5));
}

#[test]
fn reply_inherits_room_and_syscall() {
    let room = Uuid::new_v4();
    let req = Frame::request(SHAPE_REMOVE, Data::new()).with_room_id(room);
    let done = req.done();

    assert_eq!(done.parent_id, Some(req.id));
    assert_eq!(done.room_id, Some(room));
    assert_eq!(done.syscall, SHAPE_REMOVE);
    assert_eq!(done.status, Status::Done);
}

#[test]
fn error_from_typed() {
    #[derive(Debug, thiserror::Error)]
    #[error("join a room first")]
    struct NotJoined;

    impl ErrorCode for NotJoined {
        fn error_code(&self) -> &'static str {
            "E_NOT_JOINED"
        }
    }

    let req = Frame::request(SHAPE_UPSERT, Data::new());
    let err = req.error_from(&NotJoined);

    assert_eq!(err.status, Status::Error);
    assert_eq!(err.error_parts(), ("E_NOT_JOINED", "join a room first"));
    assert_eq!(err.data.get(KEY_RETRYABLE).and_then(Value::as_bool), Some(false));
}

#[test]
fn prefix_extraction() {
    let frame = Frame::request(PRESENCE_TRACK, Data::new());
    assert_eq!(frame.prefix(), "presence");

    let frame = Frame::request("noseparator", Data::new());
    assert_eq!(frame.prefix(), "noseparator");
}

#[test]
fn status_serializes_as_lowercase_json() {
    assert_eq!(serde_json::to_string(&Status::Request).expect("serialize"), "\"request\"");
    assert!(serde_json::from_str::<Status>("\"Error\"").is_err());
}
