#![forbid(unsafe_code)]

use bytes::{Buf as _, BufMut as _, BytesMut};
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size for v1.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

/// Length-prefix header size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a `u32` big-endian length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload_len);
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode a single frame from the start of `src`, returning the message and
/// the number of bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	if src.len() < FRAME_HEADER_LEN {
		return Err(FramingError::InsufficientData {
			need: FRAME_HEADER_LEN,
			have: src.len(),
		});
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	let need = FRAME_HEADER_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[FRAME_HEADER_LEN..need])?;
	Ok((msg, need))
}

/// Incremental frame decoder over a growable receive buffer.
///
/// Feed transport chunks with [`FrameDecoder::extend`] and drain completed
/// frames with [`FrameDecoder::next_frame`] until it returns `None`.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	/// Append raw bytes read from the transport.
	pub fn extend(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Bytes currently buffered but not yet consumed.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}

	/// Try to decode the next complete frame.
	///
	/// `Ok(None)` means more bytes are needed; an oversized length prefix is
	/// a hard error since the stream can no longer be trusted.
	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		if self.buf.len() < FRAME_HEADER_LEN {
			return Ok(None);
		}

		let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
		if len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len,
				max: self.max_frame_size,
			});
		}

		let need = FRAME_HEADER_LEN + len;
		if self.buf.len() < need {
			// Reserve up front so large frames don't grow the buffer in steps.
			self.buf.reserve(need - self.buf.len());
			return Ok(None);
		}

		let mut frame = self.buf.split_to(need);
		frame.advance(FRAME_HEADER_LEN);
		let msg = M::decode(&frame[..])?;
		Ok(Some(msg))
	}
}

/// Append an encoded frame into an existing buffer.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	buf.reserve(FRAME_HEADER_LEN + payload_len);
	buf.put_u32(payload_len as u32);
	msg.encode(buf)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint64, tag = "2")]
		n: u64,
	}

	#[test]
	fn encode_decode_roundtrip() {
		let msg = TestMsg {
			s: "hello".to_string(),
			n: 42,
		};

		let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let (decoded, consumed) = decode_frame::<TestMsg>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(consumed, frame.len());
		assert_eq!(decoded, msg);
	}

	#[test]
	fn decoder_handles_partial_and_coalesced_frames() {
		let a = TestMsg { s: "a".into(), n: 1 };
		let b = TestMsg { s: "b".into(), n: 2 };

		let mut wire = encode_frame(&a, DEFAULT_MAX_FRAME_SIZE).expect("encode a");
		wire.extend_from_slice(&encode_frame(&b, DEFAULT_MAX_FRAME_SIZE).expect("encode b"));

		let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);

		// First chunk stops mid-way through frame A.
		dec.extend(&wire[..3]);
		assert!(dec.next_frame::<TestMsg>().expect("ok").is_none());

		// Remainder carries the rest of A plus all of B.
		dec.extend(&wire[3..]);
		assert_eq!(dec.next_frame::<TestMsg>().expect("ok").expect("frame a"), a);
		assert_eq!(dec.next_frame::<TestMsg>().expect("ok").expect("frame b"), b);
		assert!(dec.next_frame::<TestMsg>().expect("ok").is_none());
		assert_eq!(dec.buffered(), 0);
	}

	#[test]
	fn encode_rejects_oversized_payload() {
		let msg = TestMsg {
			s: "x".repeat(10_000),
			n: 1,
		};

		match encode_frame(&msg, 64).unwrap_err() {
			FramingError::FrameTooLarge { len, max } => assert!(len > max),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decoder_rejects_oversized_length_prefix() {
		let mut dec = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		dec.extend(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

		match dec.next_frame::<TestMsg>().unwrap_err() {
			FramingError::FrameTooLarge { .. } => {}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_into_appends_after_existing_bytes() {
		let msg = TestMsg { s: "tail".into(), n: 9 };

		let mut buf = BytesMut::from(&b"head"[..]);
		encode_frame_into(&mut buf, &msg, DEFAULT_MAX_FRAME_SIZE).expect("encode into");

		assert_eq!(&buf[..4], b"head");
		let (decoded, _) = decode_frame::<TestMsg>(&buf[4..], DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert_eq!(decoded, msg);
	}
}
