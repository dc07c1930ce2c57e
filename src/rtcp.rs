//! Minimal RTCP sender/receiver reports (§6 "RTCP").
//!
//! Only enough of RFC 3550 §6.4 is implemented to drive the adaptive
//! controller: a receiver report's fraction-lost byte is the one field
//! this crate trusts; everything else in the report blocks is carried
//! for wire plausibility but not interpreted on receipt. Full RTCP
//! (multiple report blocks, SDES, BYE, APP) is out of scope (§1).

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;

const HEADER_LEN: usize = 4;
const SR_BODY_LEN: usize = 20;
const REPORT_BLOCK_LEN: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenderReport {
	pub ssrc: u32,
	pub ntp_seconds: u32,
	pub ntp_fraction: u32,
	pub rtp_timestamp: u32,
	pub packet_count: u32,
	pub octet_count: u32,
}

impl SenderReport {
	pub fn serialize(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(HEADER_LEN + SR_BODY_LEN);
		let length_words = ((HEADER_LEN + SR_BODY_LEN) / 4 - 1) as u16;
		buffer.push(0x80); // V=2, P=0, RC=0
		buffer.push(PT_SENDER_REPORT);
		buffer.extend(length_words.to_be_bytes());
		buffer.extend(self.ssrc.to_be_bytes());
		buffer.extend(self.ntp_seconds.to_be_bytes());
		buffer.extend(self.ntp_fraction.to_be_bytes());
		buffer.extend(self.rtp_timestamp.to_be_bytes());
		buffer.extend(self.packet_count.to_be_bytes());
		buffer.extend(self.octet_count.to_be_bytes());
		buffer
	}

	pub fn parse(bytes: &[u8]) -> Option<Self> {
		if bytes.len() < HEADER_LEN + SR_BODY_LEN || bytes[1] != PT_SENDER_REPORT {
			return None;
		}
		let mut cursor = Cursor::new(&bytes[HEADER_LEN..]);
		Some(Self {
			ssrc: cursor.read_u32::<BigEndian>().ok()?,
			ntp_seconds: cursor.read_u32::<BigEndian>().ok()?,
			ntp_fraction: cursor.read_u32::<BigEndian>().ok()?,
			rtp_timestamp: cursor.read_u32::<BigEndian>().ok()?,
			packet_count: cursor.read_u32::<BigEndian>().ok()?,
			octet_count: cursor.read_u32::<BigEndian>().ok()?,
		})
	}
}

/// A receiver report with exactly one report block, which is all a
/// single-peer session ever needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiverReport {
	pub reporter_ssrc: u32,
	pub source_ssrc: u32,
	/// Fraction of packets lost since the last report, as an 8-bit
	/// fixed-point fraction of 256 (RFC 3550 §6.4.1) — the only field
	/// the controller trusts.
	pub fraction_lost: u8,
	pub cumulative_lost: u32,
	pub highest_seq: u32,
	pub jitter: u32,
}

impl ReceiverReport {
	pub fn fraction_lost_ratio(&self) -> f64 {
		self.fraction_lost as f64 / 256.0
	}

	pub fn serialize(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(HEADER_LEN + 4 + REPORT_BLOCK_LEN);
		let length_words = ((HEADER_LEN + 4 + REPORT_BLOCK_LEN) / 4 - 1) as u16;
		buffer.push(0x81); // V=2, P=0, RC=1
		buffer.push(PT_RECEIVER_REPORT);
		buffer.extend(length_words.to_be_bytes());
		buffer.extend(self.reporter_ssrc.to_be_bytes());

		buffer.extend(self.source_ssrc.to_be_bytes());
		let cumulative = self.cumulative_lost & 0x00ff_ffff;
		buffer.push(self.fraction_lost);
		buffer.extend(&cumulative.to_be_bytes()[1..]);
		buffer.extend(self.highest_seq.to_be_bytes());
		buffer.extend(self.jitter.to_be_bytes());
		buffer.extend(0u32.to_be_bytes()); // LSR, unused
		buffer.extend(0u32.to_be_bytes()); // DLSR, unused

		buffer
	}

	pub fn parse(bytes: &[u8]) -> Option<Self> {
		if bytes.len() < HEADER_LEN + 4 + REPORT_BLOCK_LEN || bytes[1] != PT_RECEIVER_REPORT {
			return None;
		}
		let mut cursor = Cursor::new(&bytes[HEADER_LEN..]);
		let reporter_ssrc = cursor.read_u32::<BigEndian>().ok()?;
		let source_ssrc = cursor.read_u32::<BigEndian>().ok()?;
		let fraction_lost = cursor.read_u8().ok()?;
		let mut cumulative_bytes = [0u8; 4];
		cursor.read_exact(&mut cumulative_bytes[1..]).ok()?;
		let cumulative_lost = u32::from_be_bytes(cumulative_bytes);
		let highest_seq = cursor.read_u32::<BigEndian>().ok()?;
		let jitter = cursor.read_u32::<BigEndian>().ok()?;

		Some(Self { reporter_ssrc, source_ssrc, fraction_lost, cumulative_lost, highest_seq, jitter })
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RtcpPacket {
	SenderReport(SenderReport),
	ReceiverReport(ReceiverReport),
}

/// Dispatch on the packet-type byte. Returns `None` for anything shorter
/// than a header or carrying a packet type this crate doesn't emit.
pub fn parse(bytes: &[u8]) -> Option<RtcpPacket> {
	if bytes.len() < HEADER_LEN {
		return None;
	}
	match bytes[1] {
		PT_SENDER_REPORT => SenderReport::parse(bytes).map(RtcpPacket::SenderReport),
		PT_RECEIVER_REPORT => ReceiverReport::parse(bytes).map(RtcpPacket::ReceiverReport),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sender_report_round_trip() {
		let sr = SenderReport { ssrc: 0x1111_2222, ntp_seconds: 1, ntp_fraction: 2, rtp_timestamp: 3000, packet_count: 42, octet_count: 9001 };
		let bytes = sr.serialize();
		assert_eq!(SenderReport::parse(&bytes), Some(sr));
		assert_eq!(parse(&bytes), Some(RtcpPacket::SenderReport(sr)));
	}

	#[test]
	fn receiver_report_round_trip_and_fraction_lost() {
		let rr = ReceiverReport { reporter_ssrc: 7, source_ssrc: 9, fraction_lost: 64, cumulative_lost: 123, highest_seq: 5000, jitter: 10 };
		let bytes = rr.serialize();
		let parsed = ReceiverReport::parse(&bytes).unwrap();
		assert_eq!(parsed, rr);
		assert!((parsed.fraction_lost_ratio() - 0.25).abs() < 1e-9);
	}

	#[test]
	fn rejects_short_or_wrong_type() {
		assert!(SenderReport::parse(&[0u8; 4]).is_none());
		let rr = ReceiverReport { reporter_ssrc: 1, source_ssrc: 2, fraction_lost: 0, cumulative_lost: 0, highest_seq: 0, jitter: 0 };
		assert!(SenderReport::parse(&rr.serialize()).is_none());
	}
}
