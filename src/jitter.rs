//! Jitter-tolerant reorder/playback buffer (C4).
//!
//! Holds arriving packets until it judges the buffer "ready to play":
//! long enough for the configured target delay to have elapsed, and deep
//! enough (in RTP-timestamp terms) to absorb the currently estimated
//! jitter. Packets that arrive far enough behind `next_seq` to be
//! useless are dropped rather than buffered; packets that sit unclaimed
//! past `max_delay_ms` are evicted by periodic cleanup.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::rtp::{seq_distance, Packet};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_BUFFERED_PACKETS: usize = 100;
/// RFC 3550 jitter EMA smoothing factor.
const JITTER_ALPHA: f64 = 0.125;
/// RTP timestamp ticks per millisecond, assuming a 90 kHz media clock.
const TICKS_PER_MS: f64 = 90.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
	pub packets_buffered: u64,
	pub packets_played: u64,
	pub packets_dropped: u64,
	pub packets_reordered: u64,
	pub avg_jitter_ms: f64,
	pub current_packets: usize,
	pub current_depth_ms: u32,
}

impl Stats {
	pub fn reorder_rate(&self) -> f64 {
		if self.packets_buffered == 0 {
			0.0
		} else {
			self.packets_reordered as f64 / self.packets_buffered as f64
		}
	}

	pub fn drop_rate(&self) -> f64 {
		if self.packets_buffered == 0 {
			0.0
		} else {
			self.packets_dropped as f64 / self.packets_buffered as f64
		}
	}
}

pub struct PlaybackBuffer {
	target_delay_ms: u32,
	max_delay_ms: u32,
	reorder_tolerance: u16,

	buffer: BTreeMap<u16, Packet>,
	next_seq: Option<u16>,
	highest_seq: Option<u16>,

	first_packet_time: Option<Instant>,
	last_pop_time: Option<Instant>,
	last_cleanup_time: Instant,

	jitter_estimator_ms: f64,
	jitter_variance_ms: f64,
	last_rtp_timestamp: Option<u32>,

	stats: Stats,
}

impl PlaybackBuffer {
	pub fn new(target_delay_ms: u32, max_delay_ms: u32, reorder_tolerance: u16) -> Self {
		Self {
			target_delay_ms,
			max_delay_ms,
			reorder_tolerance,
			buffer: BTreeMap::new(),
			next_seq: None,
			highest_seq: None,
			first_packet_time: None,
			last_pop_time: None,
			last_cleanup_time: Instant::now(),
			jitter_estimator_ms: 0.0,
			jitter_variance_ms: 0.0,
			last_rtp_timestamp: None,
			stats: Stats::default(),
		}
	}

	/// Insert a received packet. Returns `false` if it was a duplicate or
	/// too old to be useful (and was therefore dropped, not buffered).
	pub fn push(&mut self, packet: Packet) -> bool {
		let seq = packet.sequence;
		let now = Instant::now();

		if self.next_seq.is_none() {
			self.next_seq = Some(seq);
			self.highest_seq = Some(seq);
			self.first_packet_time = Some(now);
		}

		if self.buffer.contains_key(&seq) {
			return false;
		}

		if let Some(next) = self.next_seq {
			if seq_distance(seq, next) < -(self.reorder_tolerance as i32) {
				self.stats.packets_dropped += 1;
				return false;
			}
		}

		if let Some(highest) = self.highest_seq {
			if seq_distance(seq, highest) < 0 {
				self.stats.packets_reordered += 1;
			}
			if seq_distance(seq, highest) > 0 {
				self.highest_seq = Some(seq);
			}
		}

		self.update_jitter(&packet, now);
		self.buffer.insert(seq, packet);
		self.stats.packets_buffered += 1;

		if now.duration_since(self.last_cleanup_time) > CLEANUP_INTERVAL {
			self.cleanup();
			self.last_cleanup_time = now;
		}

		true
	}

	/// Pop the next in-order packet, if the buffer judges itself ready to
	/// play and that packet is actually present. If `next_seq` is missing
	/// (lost), advances past it and returns `None` — the caller should
	/// call `pop` again to see if a later packet is now playable.
	pub fn pop(&mut self) -> Option<Packet> {
		let next_seq = self.next_seq?;

		if !self.is_ready_to_play() {
			return None;
		}

		if let Some(packet) = self.buffer.remove(&next_seq) {
			self.stats.packets_played += 1;
			self.next_seq = Some(next_seq.wrapping_add(1));
			self.last_pop_time = Some(Instant::now());
			return Some(packet);
		}

		let advanced = next_seq.wrapping_add(1);
		self.next_seq = Some(advanced);

		if let Some(&min_seq) = self.buffer.keys().next() {
			if seq_distance(min_seq, advanced) > 0 {
				self.next_seq = Some(min_seq);
			}
		}

		None
	}

	/// Pop up to `max_count` packets in playback order, stopping at the
	/// first gap the buffer isn't ready to cross yet.
	pub fn pop_batch(&mut self, max_count: usize) -> Vec<Packet> {
		let mut packets = Vec::with_capacity(max_count);
		for _ in 0..max_count {
			match self.pop() {
				Some(packet) => packets.push(packet),
				None => break,
			}
		}
		packets
	}

	fn is_ready_to_play(&self) -> bool {
		if self.buffer.is_empty() {
			return false;
		}

		if let Some(first_packet_time) = self.first_packet_time {
			let elapsed = first_packet_time.elapsed().as_millis() as u32;
			if elapsed < self.target_delay_ms {
				return false;
			}
		}

		let required_depth = (self.target_delay_ms as f64 + 2.0 * self.jitter_estimator_ms).min(self.max_delay_ms as f64);
		if (self.depth_ms() as f64) < required_depth {
			return false;
		}

		true
	}

	/// Buffer depth in milliseconds, derived from the spread of RTP
	/// timestamps currently held (90 kHz clock assumed). Wrap-safe: the
	/// spread is computed via signed distance from an arbitrary anchor
	/// rather than naive integer min/max, which would blow up across a
	/// timestamp wrap within the buffered set.
	pub fn depth_ms(&self) -> u32 {
		if self.buffer.len() < 2 {
			return 0;
		}
		let anchor = self.buffer.values().next().expect("checked len >= 2").timestamp;
		let (min_d, max_d) = self
			.buffer
			.values()
			.map(|p| crate::rtp::ts_distance(p.timestamp, anchor))
			.fold((0i64, 0i64), |(lo, hi), d| (lo.min(d), hi.max(d)));
		((max_d - min_d) as f64 / TICKS_PER_MS) as u32
	}

	pub fn depth_packets(&self) -> usize {
		self.buffer.len()
	}

	fn update_jitter(&mut self, packet: &Packet, now: Instant) {
		let (Some(last_pop_time), Some(last_rtp_timestamp)) = (self.last_pop_time, self.last_rtp_timestamp) else {
			self.last_rtp_timestamp = Some(packet.timestamp);
			return;
		};

		let arrival_delta_ms = now.duration_since(last_pop_time).as_secs_f64() * 1000.0;
		let rtp_delta_ms = crate::rtp::ts_distance(packet.timestamp, last_rtp_timestamp) as f64 / TICKS_PER_MS;

		let diff = (arrival_delta_ms - rtp_delta_ms).abs();
		self.jitter_estimator_ms = (1.0 - JITTER_ALPHA) * self.jitter_estimator_ms + JITTER_ALPHA * diff;
		self.jitter_variance_ms = (1.0 - JITTER_ALPHA) * self.jitter_variance_ms + JITTER_ALPHA * (diff - self.jitter_estimator_ms).abs();

		self.last_rtp_timestamp = Some(packet.timestamp);
	}

	/// Evict packets too far behind `next_seq` to ever be played, and cap
	/// total buffered packets as a defense against an unbounded backlog.
	fn cleanup(&mut self) {
		if self.buffer.is_empty() {
			return;
		}

		let cutoff = self.next_seq.map(|n| n.wrapping_sub(self.reorder_tolerance));
		if let Some(cutoff) = cutoff {
			let stale: Vec<u16> = self.buffer.keys().copied().filter(|&seq| seq_distance(seq, cutoff) < 0).collect();
			for seq in stale {
				self.buffer.remove(&seq);
				self.stats.packets_dropped += 1;
			}
		}

		while self.buffer.len() > MAX_BUFFERED_PACKETS {
			if let Some(&oldest) = self.buffer.keys().next() {
				self.buffer.remove(&oldest);
				self.stats.packets_dropped += 1;
			}
		}
	}

	pub fn reset(&mut self) {
		self.buffer.clear();
		self.next_seq = None;
		self.highest_seq = None;
		self.first_packet_time = None;
		self.last_pop_time = None;
		self.jitter_estimator_ms = 0.0;
		self.jitter_variance_ms = 0.0;
		self.last_rtp_timestamp = None;
	}

	pub fn stats(&self) -> Stats {
		Stats {
			current_packets: self.buffer.len(),
			current_depth_ms: self.depth_ms(),
			avg_jitter_ms: self.jitter_estimator_ms,
			..self.stats
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use crate::rtp::PT_MEDIA;

	fn packet(seq: u16, ts: u32) -> Packet {
		Packet::new(PT_MEDIA, false, seq, ts, 0xabcd, Bytes::from_static(b"x"))
	}

	#[test]
	fn duplicate_push_is_rejected() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		assert!(buffer.push(packet(1, 3000)));
		assert!(!buffer.push(packet(1, 3000)));
		assert_eq!(buffer.depth_packets(), 1);
	}

	#[test]
	fn far_past_packet_is_dropped() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		buffer.push(packet(100, 0));
		assert!(!buffer.push(packet(90, 0)));
		assert_eq!(buffer.stats().packets_dropped, 1);
	}

	#[test]
	fn reorder_is_counted_but_still_buffered() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		buffer.push(packet(10, 0));
		buffer.push(packet(12, 0));
		assert!(buffer.push(packet(11, 0)));
		assert_eq!(buffer.stats().packets_reordered, 1);
		assert_eq!(buffer.depth_packets(), 3);
	}

	#[test]
	fn reorder_within_tolerance_is_played_back_in_order() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		for (seq, ts) in [(0u16, 0u32), (1, 3000), (3, 9000), (2, 6000), (4, 12000)] {
			buffer.push(packet(seq, ts));
		}

		let popped = buffer.pop_batch(10);
		assert_eq!(popped.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
		assert_eq!(buffer.stats().packets_reordered, 1);
	}

	#[test]
	fn pop_respects_target_delay() {
		let mut buffer = PlaybackBuffer::new(1_000_000, 2_000_000, 5);
		buffer.push(packet(0, 0));
		assert!(buffer.pop().is_none(), "should wait out target_delay_ms before playing");
	}

	#[test]
	fn pop_in_order_with_zero_delay() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		buffer.push(packet(0, 0));
		buffer.push(packet(1, 3000));
		buffer.push(packet(2, 6000));

		let popped = buffer.pop_batch(10);
		assert_eq!(popped.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
	}

	#[test]
	fn missing_packet_is_skipped_not_blocked_forever() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		buffer.push(packet(0, 0));
		buffer.push(packet(2, 6000)); // seq 1 never arrives

		assert_eq!(buffer.pop().map(|p| p.sequence), Some(0));
		assert!(buffer.pop().is_none()); // seq 1 missing, advances past it
		assert_eq!(buffer.pop().map(|p| p.sequence), Some(2));
	}

	#[test]
	fn reset_clears_all_state() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		buffer.push(packet(5, 0));
		buffer.reset();
		assert_eq!(buffer.depth_packets(), 0);
		assert!(buffer.pop().is_none());
	}

	#[test]
	fn sequence_wraps_across_u16_boundary() {
		let mut buffer = PlaybackBuffer::new(0, 500, 5);
		buffer.push(packet(65534, 0));
		buffer.push(packet(65535, 3000));
		buffer.push(packet(0, 6000));

		let popped = buffer.pop_batch(10);
		assert_eq!(popped.iter().map(|p| p.sequence).collect::<Vec<_>>(), vec![65534, 65535, 0]);
	}

	#[cfg(test)]
	mod proptests {
		use super::*;
		use proptest::prelude::*;

		proptest! {
			#[test]
			fn depth_packets_matches_pushed_unique_sequences(seqs in prop::collection::hash_set(0u16..2000, 1..50)) {
				let mut buffer = PlaybackBuffer::new(0, 500, 5);
				let mut ordered: Vec<u16> = seqs.into_iter().collect();
				ordered.sort();
				let base = ordered[0];
				for &s in &ordered {
					buffer.push(packet(s, (s as u32) * 3000));
				}
				prop_assert_eq!(buffer.depth_packets(), ordered.len());
				let _ = base;
			}
		}
	}
}
