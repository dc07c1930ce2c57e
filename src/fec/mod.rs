//! Forward error correction and redundancy encoding (C3).
//!
//! [`FecEngine`] is symmetric: the same instance can `protect` an
//! outgoing media stream and `recover` an incoming one, though in
//! practice an engine only ever runs one direction at a time (the
//! orchestrator, §engine, keeps one instance per direction).

pub mod parity;
pub mod red;

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::field;
use crate::rtp::{seq_distance, Packet};
use parity::ParityHeader;

/// Number of recent media packets kept around so RED can find "the
/// previous packet" to duplicate as a secondary. `original_source`
/// calls this `red_history_size`; the current revision only ever reads
/// the single most recent entry, but the ring is sized for a future
/// multi-secondary revision.
const RED_RING_SIZE: usize = 3;

/// Sequence numbers are re-stamped into the group every 30th packet or on
/// a marker bit (§4.3 step 2, "critical packet").
const CRITICAL_PERIOD: u16 = 30;

#[derive(Clone, Debug)]
pub struct FecConfig {
	/// `G`: media packets per FEC group. Must be <= [`parity::MAX_COEFFS`]
	/// (10) — the wire header has no room for more coefficients.
	pub group_size: usize,
	pub enable_red: bool,
	pub min_protection_ratio: f32,
	pub max_protection_ratio: f32,
	pub media_payload_type: u8,
	pub fec_payload_type: u8,
	pub red_payload_type: u8,
}

impl Default for FecConfig {
	fn default() -> Self {
		Self {
			group_size: 10,
			enable_red: true,
			min_protection_ratio: 0.1,
			max_protection_ratio: 0.5,
			media_payload_type: crate::rtp::PT_MEDIA,
			fec_payload_type: crate::rtp::PT_FEC,
			red_payload_type: crate::rtp::PT_RED,
		}
	}
}

/// Counters exported by the FEC engine (§4.3 "Statistics exported"). The
/// engine holds the authoritative mutable counters; callers only ever see
/// an immutable snapshot via [`FecEngine::stats`] — this is the
/// statistics-drift redesign from SPEC_FULL.md §9.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
	pub packets_sent: u64,
	pub packets_received: u64,
	pub packets_recovered: u64,
	pub packets_lost: u64,
	pub fec_packets_generated: u64,
}

impl Stats {
	pub fn overhead_ratio(&self) -> f64 {
		if self.packets_sent == 0 {
			0.0
		} else {
			self.fec_packets_generated as f64 / self.packets_sent as f64
		}
	}

	pub fn recovery_rate(&self) -> f64 {
		let denominator = self.packets_recovered + self.packets_lost;
		if denominator == 0 {
			0.0
		} else {
			self.packets_recovered as f64 / denominator as f64
		}
	}
}

pub struct FecEngine {
	config: FecConfig,
	protection_ratio: f32,
	ssrc: u32,
	group: Vec<Packet>,
	red_ring: VecDeque<Packet>,
	stats: Stats,
}

impl FecEngine {
	pub fn new(config: FecConfig, initial_protection_ratio: f32, ssrc: u32) -> Self {
		assert!(config.group_size >= 1 && config.group_size <= parity::MAX_COEFFS, "group_size must be in [1, {}]", parity::MAX_COEFFS);

		let mut engine = Self {
			protection_ratio: initial_protection_ratio,
			config,
			ssrc,
			group: Vec::new(),
			red_ring: VecDeque::with_capacity(RED_RING_SIZE),
			stats: Stats::default(),
		};
		engine.set_protection_ratio(initial_protection_ratio);
		engine
	}

	pub fn protection_ratio(&self) -> f32 {
		self.protection_ratio
	}

	/// Clamp to `[min_protection_ratio, max_protection_ratio]`, per the
	/// global invariant in §3 ("Protection ratio stays within [min, max]").
	pub fn set_protection_ratio(&mut self, ratio: f32) {
		self.protection_ratio = ratio.clamp(self.config.min_protection_ratio, self.config.max_protection_ratio);
	}

	pub fn stats(&self) -> Stats {
		self.stats
	}

	fn is_critical(packet: &Packet) -> bool {
		packet.marker || packet.sequence % CRITICAL_PERIOD == 0
	}

	/// Encode one outgoing media packet: emit it, optionally emit a RED
	/// duplicate, and flush a parity batch if this completes a group.
	pub fn protect(&mut self, packet: Packet) -> Vec<Packet> {
		self.stats.packets_sent += 1;

		let mut out = Vec::with_capacity(2);
		out.push(packet.clone());

		if self.config.enable_red && Self::is_critical(&packet) {
			if let Some(previous) = self.red_ring.back() {
				out.push(red::encode(&packet, previous, self.config.red_payload_type, self.config.media_payload_type));
			}
		}
		self.red_ring.push_back(packet.clone());
		if self.red_ring.len() > RED_RING_SIZE {
			self.red_ring.pop_front();
		}

		self.group.push(packet);
		if self.group.len() >= self.config.group_size {
			out.extend(self.flush_group());
		}

		out
	}

	fn flush_group(&mut self) -> Vec<Packet> {
		let group = std::mem::take(&mut self.group);
		let g = group.len();
		// F = max(1, round(G * p)), per §4.3 step 3.
		let f = ((g as f32 * self.protection_ratio).round() as usize).max(1);

		let max_len = group.iter().map(|p| p.payload.len()).max().unwrap_or(0);
		let base_seq = group[0].sequence;
		let bitmask = parity::bitmask_for(base_seq, group.iter().map(|p| p.sequence));
		let last = group.last().expect("flush_group called with an empty group").clone();

		let mut parity_packets = Vec::with_capacity(f);
		for i in 0..f {
			let coeffs = field::vandermonde_row(i, g);

			let mut payload = vec![0u8; max_len];
			for (packet, &coeff) in group.iter().zip(coeffs.iter()) {
				for (slot, &byte) in payload.iter_mut().zip(packet.payload.iter()) {
					*slot = field::reduce(*slot as u32 + field::mul(coeff, byte) as u32);
				}
			}

			let header = ParityHeader::new(g as u8, base_seq, bitmask, &coeffs);
			let mut wire = header.serialize().to_vec();
			wire.extend(payload);

			let sequence = last.sequence.wrapping_add(1 + i as u16);
			parity_packets.push(Packet::new(self.config.fec_payload_type, false, sequence, last.timestamp, self.ssrc, Bytes::from(wire)));
			self.stats.fec_packets_generated += 1;
		}

		parity_packets
	}

	/// Recover the maximal sequence-ordered set of media packets from a
	/// batch of received packets (§4.3 "Decode (recover)").
	pub fn recover(&mut self, received: Vec<Packet>) -> Vec<Packet> {
		let mut media: HashMap<u16, Packet> = HashMap::new();
		let mut parity_packets = Vec::new();
		let mut red_packets = Vec::new();

		for packet in received {
			if packet.payload_type == self.config.fec_payload_type {
				parity_packets.push(packet);
			} else if packet.payload_type == self.config.red_payload_type {
				red_packets.push(packet);
			} else {
				self.stats.packets_received += 1;
				media.entry(packet.sequence).or_insert(packet);
			}
		}

		for red in &red_packets {
			self.recover_from_red(red, &mut media);
		}

		// Fixed-point iteration: one parity equation's recovery can unblock
		// another (§4.3 step 5).
		loop {
			let mut recovered_any = false;
			for parity in &parity_packets {
				if self.try_recover_one(parity, &mut media) {
					recovered_any = true;
				}
			}
			if !recovered_any {
				break;
			}
		}

		self.update_loss_stats(&media);

		let mut result: Vec<Packet> = media.into_values().collect();
		if let Some(anchor) = result.first().map(|p| p.sequence) {
			result.sort_by_key(|p| seq_distance(p.sequence, anchor));
		}
		result
	}

	fn recover_from_red(&mut self, red: &Packet, media: &mut HashMap<u16, Packet>) {
		let Some(decoded) = red::decode(red) else { return };

		if let std::collections::hash_map::Entry::Vacant(entry) = media.entry(red.sequence) {
			entry.insert(Packet::new(decoded.primary_payload_type, red.marker, red.sequence, red.timestamp, red.ssrc, decoded.primary));
		}

		for (k, secondary) in decoded.secondaries.iter().enumerate() {
			let sequence = red.sequence.wrapping_sub(1 + k as u16);
			if let std::collections::hash_map::Entry::Vacant(entry) = media.entry(sequence) {
				let timestamp = red.timestamp.wrapping_sub(secondary.ts_offset);
				entry.insert(Packet::new(secondary.payload_type, false, sequence, timestamp, red.ssrc, secondary.payload.clone()));
				self.stats.packets_recovered += 1;
			}
		}
	}

	/// Attempt to reconstruct exactly one missing packet from a parity
	/// packet. Returns whether a packet was recovered.
	fn try_recover_one(&mut self, parity: &Packet, media: &mut HashMap<u16, Packet>) -> bool {
		let Some(header) = ParityHeader::parse(&parity.payload) else { return false };
		let protected = header.protected_sequences();
		if protected.is_empty() {
			return false;
		}

		let missing: Vec<u16> = protected.iter().copied().filter(|seq| !media.contains_key(seq)).collect();
		if missing.len() != 1 {
			// |missing| == 0 is a harmless no-op; |missing| >= 2 is not
			// attempted in this revision (§9 "Multi-erasure recovery").
			return false;
		}
		let missing_seq = missing[0];
		let Some(missing_idx) = protected.iter().position(|&seq| seq == missing_seq) else { return false };
		if missing_idx >= header.coeffs_used() {
			return false;
		}
		let missing_coeff = header.coeffs[missing_idx];
		if missing_coeff == 0 {
			// Sanity guard only: the coefficient generator never emits 0.
			return false;
		}

		let fec_payload = &parity.payload[ParityHeader::LEN..];
		let mut accumulator = fec_payload.to_vec();

		for (idx, seq) in protected.iter().enumerate() {
			if *seq == missing_seq || idx >= header.coeffs_used() {
				continue;
			}
			let Some(known) = media.get(seq) else { return false };
			let coeff = header.coeffs[idx];
			for (slot, &byte) in accumulator.iter_mut().zip(known.payload.iter()) {
				*slot = field::sub(*slot, field::mul(coeff, byte));
			}
		}

		let inverse = field::inverse(missing_coeff);
		for slot in accumulator.iter_mut() {
			*slot = field::mul(*slot, inverse);
		}

		let reference = protected.iter().find_map(|seq| media.get(seq));
		let (timestamp, ssrc) = reference.map(|r| (r.timestamp, r.ssrc)).unwrap_or((parity.timestamp, parity.ssrc));

		media.insert(missing_seq, Packet::new(self.config.media_payload_type, false, missing_seq, timestamp, ssrc, Bytes::from(accumulator)));
		self.stats.packets_recovered += 1;
		true
	}

	/// Add to the cumulative loss counter any sequence gap inside this
	/// batch's span that recovery couldn't fill, mirroring
	/// `original_source/resilience.py`'s end-of-`recover` bookkeeping.
	fn update_loss_stats(&mut self, media: &HashMap<u16, Packet>) {
		if media.is_empty() {
			return;
		}
		let anchor = *media.keys().next().expect("checked non-empty");
		let (min_d, max_d) = media
			.keys()
			.map(|&seq| seq_distance(seq, anchor))
			.fold((0, 0), |(lo, hi), d| (lo.min(d), hi.max(d)));
		let span = (max_d - min_d + 1) as u64;
		let present = media.len() as u64;
		if span > present {
			self.stats.packets_lost += span - present;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rtp::PT_MEDIA;

	fn media_packet(seq: u16, ts: u32, payload: &[u8]) -> Packet {
		Packet::new(PT_MEDIA, seq % 7 == 0, seq, ts, 0x1111_2222, Bytes::copy_from_slice(payload))
	}

	fn fill_group(engine: &mut FecEngine, count: usize, start_seq: u16) -> Vec<Packet> {
		let mut out = Vec::new();
		for i in 0..count {
			let seq = start_seq.wrapping_add(i as u16);
			let packet = media_packet(seq, seq as u32 * 3000, format!("payload-{seq}").as_bytes());
			out.extend(engine.protect(packet));
		}
		out
	}

	#[test]
	fn protect_emits_media_then_parity_on_group_completion() {
		let mut engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 42);
		let sent = fill_group(&mut engine, 10, 0);

		let media_count = sent.iter().filter(|p| p.payload_type == PT_MEDIA).count();
		let parity_count = sent.iter().filter(|p| p.payload_type == crate::rtp::PT_FEC).count();
		assert_eq!(media_count, 10);
		assert_eq!(parity_count, 3); // round(10 * 0.3)
	}

	#[test]
	fn single_erasure_per_group_is_always_recovered() {
		for erased in 0..10u16 {
			let mut send_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
			let sent = fill_group(&mut send_engine, 10, 0);

			let original: Vec<Packet> = sent.iter().filter(|p| p.payload_type == PT_MEDIA).cloned().collect();
			let received: Vec<Packet> = sent.into_iter().filter(|p| !(p.payload_type == PT_MEDIA && p.sequence == erased)).collect();

			let mut recv_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
			let recovered = recv_engine.recover(received);

			let original_lost = original.iter().find(|p| p.sequence == erased).unwrap();
			let recovered_packet = recovered.iter().find(|p| p.sequence == erased).expect("erased packet not recovered");
			assert_eq!(recovered_packet.payload, original_lost.payload);
		}
	}

	#[test]
	fn two_missing_in_one_group_recovers_none() {
		let mut send_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let sent = fill_group(&mut send_engine, 10, 0);

		let received: Vec<Packet> = sent.into_iter().filter(|p| !(p.payload_type == PT_MEDIA && (p.sequence == 2 || p.sequence == 4))).collect();

		let mut recv_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let recovered = recv_engine.recover(received);

		assert!(!recovered.iter().any(|p| p.sequence == 2));
		assert!(!recovered.iter().any(|p| p.sequence == 4));
	}

	#[test]
	fn zero_missing_parity_is_a_no_op() {
		let mut send_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let sent = fill_group(&mut send_engine, 10, 0);

		let mut recv_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let recovered = recv_engine.recover(sent.clone());
		assert_eq!(recovered.len(), 10);
	}

	#[test]
	fn critical_packet_gets_a_red_duplicate() {
		let mut engine = FecEngine::new(FecConfig { group_size: 10, ..Default::default() }, 0.3, 1);
		// First packet: no previous packet to duplicate, so no RED even though marker is set.
		let first = Packet::new(PT_MEDIA, true, 0, 0, 1, Bytes::from_static(b"a"));
		let out = engine.protect(first);
		assert!(!out.iter().any(|p| p.payload_type == crate::rtp::PT_RED));

		// Second packet is critical (seq % 30 == 0 is false, but we set marker) and has a predecessor.
		let second = Packet::new(PT_MEDIA, true, 1, 3000, 1, Bytes::from_static(b"b"));
		let out = engine.protect(second);
		assert!(out.iter().any(|p| p.payload_type == crate::rtp::PT_RED));
	}

	#[test]
	fn stats_track_send_and_recover() {
		let mut send_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let sent = fill_group(&mut send_engine, 10, 0);
		assert_eq!(send_engine.stats().packets_sent, 10);
		assert_eq!(send_engine.stats().fec_packets_generated, 3);

		let received: Vec<Packet> = sent.into_iter().filter(|p| !(p.payload_type == PT_MEDIA && p.sequence == 5)).collect();
		let mut recv_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		recv_engine.recover(received);
		assert_eq!(recv_engine.stats().packets_recovered, 1);
		assert_eq!(recv_engine.stats().packets_lost, 0);
	}

	#[test]
	fn protection_ratio_is_clamped() {
		let mut engine = FecEngine::new(FecConfig::default(), 0.3, 1);
		engine.set_protection_ratio(0.9);
		assert_eq!(engine.protection_ratio(), 0.5);
		engine.set_protection_ratio(0.0);
		assert_eq!(engine.protection_ratio(), 0.1);
	}

	/// Send `groups` groups of 10 media packets (G=10, p=0.3 => F=3), run
	/// each transmitted group of 13 through `should_drop` to decide what the
	/// receiver actually gets, and recover group-by-group so loss stats
	/// stay scoped to one group's span at a time.
	fn run_groups(groups: usize, mut should_drop: impl FnMut(usize, usize) -> bool) -> (usize, FecEngine) {
		let mut send_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let mut recv_engine = FecEngine::new(FecConfig { enable_red: false, ..Default::default() }, 0.3, 7);
		let mut media_delivered = 0;

		for g in 0..groups {
			let sent = fill_group(&mut send_engine, 10, (g * 10) as u16);
			let received: Vec<Packet> = sent.into_iter().enumerate().filter(|(i, _)| !should_drop(g, *i)).map(|(_, p)| p).collect();
			media_delivered += recv_engine.recover(received).len();
		}

		(media_delivered, recv_engine)
	}

	#[test]
	fn no_loss_delivers_all_packets_in_order() {
		let (delivered, recv_engine) = run_groups(100, |_, _| false);
		assert_eq!(delivered, 1000);
		assert_eq!(recv_engine.stats().packets_lost, 0);
		assert_eq!(recv_engine.stats().packets_recovered, 0);
	}

	#[test]
	fn ten_percent_uniform_loss_recovers_at_least_ninety_percent() {
		// Drop exactly one media packet per group (10% of the 10 media
		// packets), cycling which slot. Every drop is a single erasure,
		// which is always recoverable, so all 1000 media packets arrive.
		let (delivered, recv_engine) = run_groups(100, |g, i| i == g % 10);
		assert_eq!(delivered, 1000);
		assert!(recv_engine.stats().packets_recovered >= 90, "expected >= 90 recovered, got {}", recv_engine.stats().packets_recovered);
		assert_eq!(recv_engine.stats().packets_lost, 0);
	}

	#[test]
	fn twenty_percent_burst_loss_is_worse_than_uniform_loss() {
		// Every group loses two consecutive media packets (slots 2 and 3).
		// Every parity packet in this revision covers the whole group
		// (§9 "Multi-erasure recovery" is not implemented), so a parity
		// equation with two unknowns can't be solved at all: both losses
		// in every affected group go unrecovered, unlike the single-loss
		// case above where every drop is fully recovered.
		let (delivered, recv_engine) = run_groups(100, |_, i| i == 2 || i == 3);
		assert_eq!(delivered, 800);
		assert_eq!(recv_engine.stats().packets_lost, 200);
		assert_eq!(recv_engine.stats().packets_recovered, 0);
	}
}
