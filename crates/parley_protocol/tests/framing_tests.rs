use bytes::BytesMut;
use parley_domain::UserId;
use parley_protocol::{
	ChatFrame, DEFAULT_MAX_FRAME_SIZE, Envelope, FramingError, decode_frame, encode_frame, encode_frame_default,
	encode_frame_into, frame_len_from_payload_len, kind, try_split_payload_from_buffer,
};
use proptest::prelude::*;

fn chat_envelope(content: &str) -> Envelope {
	Envelope::new(
		kind::CHAT,
		&ChatFrame {
			msg_id: Some("m-1".to_string()),
			from_user_id: Some(UserId(1)),
			to_user_id: UserId(2),
			content: content.to_string(),
			content_type: 1,
			created_at: Some(1_700_000_000_000),
		},
	)
	.expect("build envelope")
}

#[test]
fn encode_decode_roundtrip_slice() {
	let env = chat_envelope("hello");

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, env);
}

#[test]
fn encode_frame_default_matches_explicit_default_limit() {
	let env = chat_envelope("abc");

	let a = encode_frame_default(&env).expect("encode_frame_default");
	let b = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");

	assert_eq!(a, b);
}

#[test]
fn decode_requires_full_frame() {
	let frame = encode_frame_default(&chat_envelope("x")).expect("encode");

	let err = decode_frame(&frame[..4], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::InsufficientData { need, have } => {
			assert!(need > have);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn encode_into_appends_and_respects_existing_data() {
	let env1 = chat_envelope("one");
	let env2 = chat_envelope("two");

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &env1, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into env1");
	encode_frame_into(&mut buf, &env2, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame_into env2");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (d1, used1) = decode_frame(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode env1");
	assert_eq!(d1, env1);

	let (d2, used2) = decode_frame(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode env2");
	assert_eq!(d2, env2);

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn frame_len_helper_is_correct() {
	let env = chat_envelope("hello");

	let payload_len = serde_json::to_vec(&env).expect("to_vec").len();
	let frame = encode_frame_default(&env).expect("encode");

	assert_eq!(frame_len_from_payload_len(payload_len), frame.len());
}

#[test]
fn encode_rejects_too_large() {
	let env = chat_envelope(&"a".repeat(10_000));

	let err = encode_frame(&env, 32).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert!(len > max);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn decode_rejects_too_large_prefix() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_split_payload_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

proptest! {
	#[test]
	fn roundtrip_any_content(content in "\\PC{0,512}") {
		let env = chat_envelope(&content);
		let frame = encode_frame_default(&env).expect("encode");

		let mut buf = BytesMut::from(&frame[..]);
		let payload = try_split_payload_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("split ok")
			.expect("full frame present");

		let decoded: Envelope = serde_json::from_slice(&payload).expect("parse envelope");
		prop_assert_eq!(decoded, env);
		prop_assert!(buf.is_empty());
	}
}
