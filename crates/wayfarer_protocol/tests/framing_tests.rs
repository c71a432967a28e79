use proptest::prelude::*;
use wayfarer_protocol::convert::envelope;
use wayfarer_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, decode_frame, encode_frame, pb};

fn send_message_envelope(request_id: &str, room_id: &str, content: &str) -> pb::Envelope {
	envelope(
		request_id,
		pb::envelope::Msg::SendMessage(pb::SendMessage {
			room_id: room_id.to_string(),
			content: content.to_string(),
			kind: pb::MessageKind::Text as i32,
			reply_to: String::new(),
		}),
	)
}

#[test]
fn envelope_roundtrip() {
	let env = send_message_envelope("req-1", "general", "hello from lisbon");

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	let (decoded, consumed) = decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, env);
}

#[test]
fn decode_requires_full_frame() {
	let env = send_message_envelope("req-2", "general", "partial");
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");

	match decode_frame::<pb::Envelope>(&frame[..frame.len() - 1], DEFAULT_MAX_FRAME_SIZE).unwrap_err() {
		FramingError::InsufficientData { need, have } => assert!(need > have),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn oversized_event_is_rejected_before_encoding() {
	let env = send_message_envelope("req-3", "general", &"x".repeat(4096));

	match encode_frame(&env, 128).unwrap_err() {
		FramingError::FrameTooLarge { len, max } => assert!(len > max),
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	/// Any envelope survives the wire regardless of how the transport
	/// fragments it into read chunks.
	#[test]
	fn roundtrip_survives_arbitrary_chunking(
		content in "[a-zA-Z0-9 ,.!?]{0,256}",
		request_id in "[a-z0-9-]{1,24}",
		chunk in 1usize..64,
	) {
		let env = send_message_envelope(&request_id, "room-prop", &content);
		let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		let mut decoded = None;
		for piece in frame.chunks(chunk) {
			dec.extend(piece);
			if let Some(msg) = dec.next_frame::<pb::Envelope>().expect("decoder ok") {
				decoded = Some(msg);
			}
		}

		prop_assert_eq!(decoded.expect("a full frame was fed"), env);
		prop_assert_eq!(dec.buffered(), 0);
	}

	/// Back-to-back frames on one stream decode in order.
	#[test]
	fn coalesced_frames_decode_in_order(count in 1usize..8) {
		let envs: Vec<pb::Envelope> = (0..count)
			.map(|i| send_message_envelope(&format!("req-{i}"), "room-prop", &format!("msg {i}")))
			.collect();

		let mut wire = Vec::new();
		for env in &envs {
			wire.extend_from_slice(&encode_frame(env, DEFAULT_MAX_FRAME_SIZE).expect("encode"));
		}

		let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		dec.extend(&wire);

		for env in &envs {
			let got = dec.next_frame::<pb::Envelope>().expect("ok").expect("frame");
			prop_assert_eq!(&got, env);
		}
		prop_assert!(dec.next_frame::<pb::Envelope>().expect("ok").is_none());
	}
}
