//! RED (redundancy encoding) packets (§4.3 / §6 "RED payload layout").
//!
//! A RED payload is zero or more secondary blocks, each a 4-byte header
//! (`F=1 | PT(7) | ts_offset(14) | length(10)`) followed by `length`
//! bytes, terminated by a single 1-byte primary header (`F=0 | PT(7)`)
//! followed by the primary payload to end-of-packet. This crate's encoder
//! only ever emits one secondary (the immediately preceding media
//! packet); the decoder handles an arbitrary chain for forward
//! compatibility with a peer that emits more.

use bytes::Bytes;

use crate::rtp::Packet;

/// 14-bit timestamp offset field wraps at this many 90 kHz ticks
/// (~182 ms, §9 "RED header field widths"). A secondary whose age exceeds
/// this can't be correctly re-timestamped and is not produced by the
/// encoder (truncated timestamp offsets on decode are accepted as-is,
/// since the field width itself bounds the error to one wrap period).
pub const TS_OFFSET_MASK: u32 = 0x3fff;

/// Secondary payloads are truncated to this many bytes before encoding.
pub const SECONDARY_CAP: usize = 100;

#[derive(Clone, Debug)]
pub struct Secondary {
	pub payload_type: u8,
	pub ts_offset: u32,
	pub payload: Bytes,
}

#[derive(Clone, Debug)]
pub struct Decoded {
	pub primary_payload_type: u8,
	pub primary: Bytes,
	/// In wire order: the block closest to the primary (i.e. describing
	/// the most recently preceding packet) comes first.
	pub secondaries: Vec<Secondary>,
}

/// Build a RED packet carrying `current` as the primary encoding and a
/// truncated copy of `previous` as its single secondary.
pub fn encode(current: &Packet, previous: &Packet, red_pt: u8, media_pt: u8) -> Packet {
	let ts_offset = (current.timestamp.wrapping_sub(previous.timestamp)) & TS_OFFSET_MASK;
	let truncated_len = previous.payload.len().min(SECONDARY_CAP);

	let mut payload = Vec::with_capacity(4 + truncated_len + 1 + current.payload.len());

	// Secondary block header: F=1, PT, 14-bit ts_offset, 10-bit length.
	payload.push(0x80 | (media_pt & 0x7f));
	let packed = (ts_offset << 10) | (truncated_len as u32 & 0x3ff);
	payload.push((packed >> 16) as u8);
	payload.push((packed >> 8) as u8);
	payload.push(packed as u8);
	payload.extend_from_slice(&previous.payload[..truncated_len]);

	// Primary block header: F=0, PT.
	payload.push(media_pt & 0x7f);
	payload.extend_from_slice(&current.payload);

	Packet::new(red_pt, current.marker, current.sequence, current.timestamp, current.ssrc, Bytes::from(payload))
}

/// Parse a RED payload into its primary block and chain of secondaries.
/// Returns `None` on a truncated/malformed payload (dropped silently by
/// the caller, per §7).
pub fn decode(red: &Packet) -> Option<Decoded> {
	let payload = &red.payload;
	let mut offset = 0usize;
	let mut secondaries = Vec::new();

	loop {
		let header_byte = *payload.get(offset)?;
		offset += 1;

		if header_byte & 0x80 == 0 {
			let primary_pt = header_byte & 0x7f;
			let primary = payload.slice(offset..);
			return Some(Decoded { primary_payload_type: primary_pt, primary, secondaries });
		}

		if offset + 3 > payload.len() {
			return None;
		}
		let packed = ((payload[offset] as u32) << 16) | ((payload[offset + 1] as u32) << 8) | (payload[offset + 2] as u32);
		offset += 3;
		let ts_offset = (packed >> 10) & TS_OFFSET_MASK;
		let length = (packed & 0x3ff) as usize;

		if offset + length > payload.len() {
			return None;
		}
		let block_payload = payload.slice(offset..offset + length);
		offset += length;

		secondaries.push(Secondary { payload_type: header_byte & 0x7f, ts_offset, payload: block_payload });
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rtp::{PT_MEDIA, PT_RED};

	fn packet(seq: u16, ts: u32, payload: &[u8]) -> Packet {
		Packet::new(PT_MEDIA, false, seq, ts, 0xcafe, Bytes::copy_from_slice(payload))
	}

	#[test]
	fn round_trip_single_secondary() {
		let previous = packet(10, 3000, b"previous payload");
		let current = packet(11, 6000, b"current payload");

		let red = encode(&current, &previous, PT_RED, PT_MEDIA);
		assert_eq!(red.sequence, current.sequence);
		assert_eq!(red.timestamp, current.timestamp);

		let decoded = decode(&red).unwrap();
		assert_eq!(decoded.primary_payload_type, PT_MEDIA);
		assert_eq!(&decoded.primary[..], &current.payload[..]);
		assert_eq!(decoded.secondaries.len(), 1);
		assert_eq!(&decoded.secondaries[0].payload[..], &previous.payload[..]);
		assert_eq!(decoded.secondaries[0].ts_offset, 3000);
	}

	#[test]
	fn truncates_secondary_payload_to_cap() {
		let previous = packet(0, 0, &vec![7u8; 250]);
		let current = packet(1, 3000, b"x");

		let red = encode(&current, &previous, PT_RED, PT_MEDIA);
		let decoded = decode(&red).unwrap();
		assert_eq!(decoded.secondaries[0].payload.len(), SECONDARY_CAP);
	}

	#[test]
	fn no_secondaries_decodes_to_primary_only() {
		let current = packet(5, 1500, b"solo");
		let red = Packet::new(PT_RED, false, current.sequence, current.timestamp, current.ssrc, {
			let mut payload = vec![PT_MEDIA & 0x7f];
			payload.extend_from_slice(&current.payload);
			Bytes::from(payload)
		});

		let decoded = decode(&red).unwrap();
		assert!(decoded.secondaries.is_empty());
		assert_eq!(&decoded.primary[..], &current.payload[..]);
	}

	#[test]
	fn truncated_wire_data_is_rejected() {
		let red = Packet::new(PT_RED, false, 1, 1, 1, Bytes::from_static(&[0x80, 0, 0]));
		assert!(decode(&red).is_none());
	}
}
