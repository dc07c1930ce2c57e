//! Wire-exact FEC parity header (§6 "FEC parity payload layout").
//!
//! ```text
//! offset  size  field
//!   0      1    protected_count
//!   1      2    base_seq            (big-endian)
//!   3      2    bitmask             (big-endian; bit k -> seq base+k present)
//!   5     10    coeffs[0..9]        (one byte each; field elements)
//!  15      4    md5_prefix(header[0..15])
//! ```
//! The xor/linear-combination payload (offset 19..) is not part of this
//! struct; callers append/slice it separately.

use md5::{Digest, Md5};

use crate::rtp::seq_distance;

/// Total length of the fixed header, not including the payload.
pub const LEN: usize = 19;

/// The header only has room for 10 coefficients; §4.3 requires the group
/// size to be at most 10 when using this wire format.
pub const MAX_COEFFS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParityHeader {
	pub count: u8,
	pub base_seq: u16,
	pub bitmask: u16,
	pub coeffs: [u8; MAX_COEFFS],
}

impl ParityHeader {
	/// Total length of the fixed header, not including the payload.
	pub const LEN: usize = 19;

	pub fn new(count: u8, base_seq: u16, bitmask: u16, coeffs: &[u8]) -> Self {
		let mut fixed = [0u8; MAX_COEFFS];
		for (slot, c) in fixed.iter_mut().zip(coeffs.iter()) {
			*slot = *c;
		}
		Self { count, base_seq, bitmask, coeffs: fixed }
	}

	/// How many of the 10 stored coefficient slots actually describe a
	/// protected sequence (the rest are zero padding).
	pub fn coeffs_used(&self) -> usize {
		(self.count as usize).min(MAX_COEFFS)
	}

	/// Sequence numbers this parity packet protects, derived from the
	/// bitmask. If the bitmask is corrupt and doesn't agree with `count`,
	/// fall back to the contiguous range `[base_seq, base_seq + count)`,
	/// same fallback `original_source/resilience.py`'s
	/// `_recover_using_fec` uses.
	pub fn protected_sequences(&self) -> Vec<u16> {
		let mut seqs = Vec::with_capacity(self.count as usize);
		for k in 0..16u16 {
			if self.bitmask & (1 << k) != 0 {
				seqs.push(self.base_seq.wrapping_add(k));
			}
		}
		if seqs.len() != self.count as usize {
			seqs = (0..self.count as u16).map(|k| self.base_seq.wrapping_add(k)).collect();
		}
		seqs
	}

	pub fn serialize(&self) -> [u8; LEN] {
		let mut buffer = [0u8; LEN];
		buffer[0] = self.count;
		buffer[1..3].copy_from_slice(&self.base_seq.to_be_bytes());
		buffer[3..5].copy_from_slice(&self.bitmask.to_be_bytes());
		buffer[5..15].copy_from_slice(&self.coeffs);
		let digest = Md5::digest(&buffer[0..15]);
		buffer[15..19].copy_from_slice(&digest[0..4]);
		buffer
	}

	/// Parse and authenticate a parity header. Returns `None` for a header
	/// that is too short or whose MD5 prefix doesn't match — both cases
	/// are dropped silently by the decoder per §7.
	pub fn parse(bytes: &[u8]) -> Option<Self> {
		if bytes.len() < LEN {
			return None;
		}

		let digest = Md5::digest(&bytes[0..15]);
		if digest[0..4] != bytes[15..19] {
			return None;
		}

		let count = bytes[0];
		let base_seq = u16::from_be_bytes([bytes[1], bytes[2]]);
		let bitmask = u16::from_be_bytes([bytes[3], bytes[4]]);
		let mut coeffs = [0u8; MAX_COEFFS];
		coeffs.copy_from_slice(&bytes[5..15]);

		Some(Self { count, base_seq, bitmask, coeffs })
	}
}

/// Bitmask built from a base sequence and the actual member sequences of a
/// group, wrap-aware (used only to build headers for groups small enough
/// that every offset fits in 16 bits, which §4.3 already requires via
/// `G <= 10`).
pub fn bitmask_for(base_seq: u16, sequences: impl Iterator<Item = u16>) -> u16 {
	let mut bitmask = 0u16;
	for seq in sequences {
		let offset = seq_distance(seq, base_seq);
		if (0..16).contains(&offset) {
			bitmask |= 1 << offset;
		}
	}
	bitmask
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let header = ParityHeader::new(10, 1000, 0b11_1111_1111, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
		let bytes = header.serialize();
		let parsed = ParityHeader::parse(&bytes).unwrap();
		assert_eq!(header, parsed);
	}

	#[test]
	fn rejects_short_header() {
		assert!(ParityHeader::parse(&[0u8; 10]).is_none());
	}

	#[test]
	fn rejects_corrupted_checksum() {
		let header = ParityHeader::new(3, 0, 0b111, &[1, 2, 3]);
		let mut bytes = header.serialize();
		bytes[0] ^= 0xff; // corrupt a header field, checksum no longer matches
		assert!(ParityHeader::parse(&bytes).is_none());
	}

	#[test]
	fn protected_sequences_from_bitmask() {
		let header = ParityHeader::new(3, 100, bitmask_for(100, [100, 101, 102].into_iter()), &[1, 2, 3]);
		assert_eq!(header.protected_sequences(), vec![100, 101, 102]);
	}

	#[test]
	fn falls_back_to_contiguous_range_on_bitmask_mismatch() {
		let mut header = ParityHeader::new(3, 100, 0b1, &[1, 2, 3]); // bitmask only claims 1 packet
		header.count = 3;
		assert_eq!(header.protected_sequences(), vec![100, 101, 102]);
	}

	#[test]
	fn wraps_base_seq_near_u16_max() {
		let bitmask = bitmask_for(65534, [65534, 65535, 0].into_iter());
		let header = ParityHeader::new(3, 65534, bitmask, &[1, 2, 3]);
		assert_eq!(header.protected_sequences(), vec![65534, 65535, 0]);
	}
}
