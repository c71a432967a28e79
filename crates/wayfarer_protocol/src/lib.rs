#![forbid(unsafe_code)]

pub mod convert;
pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FrameDecoder, FramingError, decode_frame, encode_frame};

/// Generated protobuf types (`wayfarer.v1`).
#[allow(clippy::large_enum_variant)]
pub mod pb {
	include!(concat!(env!("OUT_DIR"), "/wayfarer.v1.rs"));
}

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Value written into `Envelope.version`.
	pub const PROTOCOL_VERSION: u32 = PROTOCOL_MAJOR;
}
