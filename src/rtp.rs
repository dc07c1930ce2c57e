//! RTP packet model (C1).
//!
//! A minimal, RFC 3550 §5.1 fixed-header parser/serializer. Only the
//! fields this transport cares about are modeled: padding, extensions and
//! CSRC lists are neither parsed nor emitted (every packet produced by
//! this crate has `CC = 0`, `P = 0`, `X = 0`).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       Sequence Number        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Timestamp                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                             SSRC                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use std::io::Cursor;

/// Size of the RTP fixed header this crate parses/emits.
pub const HEADER_LEN: usize = 12;

/// Default payload-type for opaque media packets (H.264, treated as opaque).
pub const PT_MEDIA: u8 = 96;

/// Default payload-type for FEC parity packets.
pub const PT_FEC: u8 = 127;

/// Default payload-type for RED (redundant encoding) packets.
pub const PT_RED: u8 = 100;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RtpError {
	#[error("packet too short: {0} bytes, need at least {HEADER_LEN}")]
	TooShort(usize),

	#[error("unsupported RTP version {0}, only version 2 is handled")]
	UnsupportedVersion(u8),
}

/// An immutable, owned RTP packet.
///
/// Sequence number and timestamp wrap modulo 2^16 / 2^32 respectively;
/// comparisons between two packets must use [`seq_distance`] /
/// [`ts_distance`] rather than plain integer comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
	pub payload_type: u8,
	pub marker: bool,
	pub sequence: u16,
	pub timestamp: u32,
	pub ssrc: u32,
	pub payload: Bytes,
}

impl Packet {
	pub fn new(payload_type: u8, marker: bool, sequence: u16, timestamp: u32, ssrc: u32, payload: Bytes) -> Self {
		Self { payload_type, marker, sequence, timestamp, ssrc, payload }
	}

	/// Parse a wire-format RTP packet. Malformed input is a caller-visible
	/// error; the engine (§7) is expected to drop it and bump a counter
	/// rather than propagate the error further.
	pub fn parse(bytes: &[u8]) -> Result<Self, RtpError> {
		if bytes.len() < HEADER_LEN {
			return Err(RtpError::TooShort(bytes.len()));
		}

		let mut cursor = Cursor::new(bytes);
		let first = cursor.read_u8().expect("checked length");
		let version = first >> 6;
		if version != 2 {
			return Err(RtpError::UnsupportedVersion(version));
		}

		let second = cursor.read_u8().expect("checked length");
		let marker = second & 0x80 != 0;
		let payload_type = second & 0x7f;

		let sequence = cursor.read_u16::<BigEndian>().expect("checked length");
		let timestamp = cursor.read_u32::<BigEndian>().expect("checked length");
		let ssrc = cursor.read_u32::<BigEndian>().expect("checked length");

		let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..]);

		Ok(Self { payload_type, marker, sequence, timestamp, ssrc, payload })
	}

	/// Serialize this packet back to wire format. Round-trips every field
	/// `parse` extracted: `parse(serialize(p)) == p` for any `p`.
	pub fn serialize(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(HEADER_LEN + self.payload.len());

		buffer.push(2 << 6); // V=2, P=0, X=0, CC=0
		buffer.push(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
		buffer.extend(self.sequence.to_be_bytes());
		buffer.extend(self.timestamp.to_be_bytes());
		buffer.extend(self.ssrc.to_be_bytes());
		buffer.extend_from_slice(&self.payload);

		buffer
	}
}

/// Signed 16-bit wrap-aware distance `a - b`, positive when `a` is ahead of `b`.
pub fn seq_distance(a: u16, b: u16) -> i32 {
	(a.wrapping_sub(b) as i16) as i32
}

/// True if sequence `a` is strictly before sequence `b`, wrap-aware.
pub fn seq_lt(a: u16, b: u16) -> bool {
	seq_distance(a, b) < 0
}

/// Signed 32-bit wrap-aware distance `a - b` for RTP timestamps.
pub fn ts_distance(a: u32, b: u32) -> i64 {
	(a.wrapping_sub(b) as i32) as i64
}
