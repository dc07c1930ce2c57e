//! Adaptive bitrate / FEC protection controller (C5).
//!
//! Tracks sliding windows of recently observed loss rate, RTT, jitter and
//! bandwidth, and on a fixed tick interval derives a target bitrate and
//! FEC protection ratio from them. Bitrate changes use hysteresis (an
//! "increase" only fires after several consecutive stable samples) so a
//! single good sample doesn't cause oscillation; FEC protection tracks
//! loss more directly since under-protecting is costlier than a little
//! extra redundancy.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW_LEN: usize = 10;
const INCREASE_FACTOR: f64 = 1.05;
const DECREASE_FACTOR: f64 = 0.85;
const STABLE_THRESHOLD: u32 = 5;
const MIN_SAMPLES_TO_ADAPT: usize = 3;

/// Bitrate and protection ratio produced by an adaptation tick, together
/// with whether each one actually changed (so a caller can decide whether
/// it's worth logging / re-keying the FEC engine).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Adaptation {
	pub bitrate: u32,
	pub bitrate_changed: bool,
	pub protection_ratio: f32,
	pub protection_ratio_changed: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
	pub loss_rate: f64,
	pub rtt_ms: f64,
	pub jitter_ms: f64,
	pub bandwidth_mbps: f64,
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
	pub initial_bitrate: u32,
	pub min_bitrate: u32,
	pub max_bitrate: u32,
	pub min_protection_ratio: f32,
	pub max_protection_ratio: f32,
	pub adapt_interval: Duration,
}

impl Default for ControllerConfig {
	fn default() -> Self {
		Self {
			initial_bitrate: 2_500_000,
			min_bitrate: 500_000,
			max_bitrate: 8_000_000,
			min_protection_ratio: 0.1,
			max_protection_ratio: 0.5,
			adapt_interval: Duration::from_secs(2),
		}
	}
}

pub struct AdaptiveController {
	config: ControllerConfig,

	current_bitrate: u32,
	current_protection_ratio: f32,
	stable_count: u32,

	loss_samples: VecDeque<f64>,
	rtt_samples: VecDeque<f64>,
	jitter_samples: VecDeque<f64>,
	bandwidth_samples: VecDeque<f64>,

	last_bandwidth_sample: Option<(u64, Instant)>,
	last_adapt: Option<Instant>,
	stats: Stats,
}

impl AdaptiveController {
	pub fn new(config: ControllerConfig, initial_protection_ratio: f32) -> Self {
		let current_bitrate = config.initial_bitrate;
		Self {
			current_protection_ratio: initial_protection_ratio.clamp(config.min_protection_ratio, config.max_protection_ratio),
			current_bitrate,
			config,
			stable_count: 0,
			loss_samples: VecDeque::with_capacity(WINDOW_LEN),
			rtt_samples: VecDeque::with_capacity(WINDOW_LEN),
			jitter_samples: VecDeque::with_capacity(WINDOW_LEN),
			bandwidth_samples: VecDeque::with_capacity(WINDOW_LEN),
			last_bandwidth_sample: None,
			last_adapt: None,
			stats: Stats::default(),
		}
	}

	pub fn current_bitrate(&self) -> u32 {
		self.current_bitrate
	}

	pub fn current_protection_ratio(&self) -> f32 {
		self.current_protection_ratio
	}

	pub fn stats(&self) -> Stats {
		self.stats
	}

	fn push_window(window: &mut VecDeque<f64>, value: f64) {
		if window.len() == WINDOW_LEN {
			window.pop_front();
		}
		window.push_back(value);
	}

	pub fn record_loss(&mut self, rate: f64) {
		Self::push_window(&mut self.loss_samples, rate);
		self.stats.loss_rate = rate;
	}

	pub fn record_rtt_ms(&mut self, rtt_ms: f64) {
		Self::push_window(&mut self.rtt_samples, rtt_ms);
		self.stats.rtt_ms = rtt_ms;
	}

	pub fn record_jitter_ms(&mut self, jitter_ms: f64) {
		Self::push_window(&mut self.jitter_samples, jitter_ms);
		self.stats.jitter_ms = jitter_ms;
	}

	/// Derive a bandwidth sample from a cumulative bytes-sent counter,
	/// same delta/time_delta approach as the original stats feed.
	pub fn record_bytes_sent(&mut self, bytes_sent: u64, now: Instant) {
		if let Some((last_bytes, last_time)) = self.last_bandwidth_sample {
			let time_delta = now.duration_since(last_time).as_secs_f64();
			if time_delta > 0.0 {
				let bytes_delta = bytes_sent.saturating_sub(last_bytes) as f64;
				let mbps = (bytes_delta * 8.0) / (time_delta * 1_000_000.0);
				Self::push_window(&mut self.bandwidth_samples, mbps);
				self.stats.bandwidth_mbps = mbps;
			}
		}
		self.last_bandwidth_sample = Some((bytes_sent, now));
	}

	fn mean(samples: &VecDeque<f64>) -> f64 {
		samples.iter().sum::<f64>() / samples.len() as f64
	}

	/// Run one adaptation tick if `adapt_interval` has elapsed and enough
	/// samples have accumulated. Returns `None` otherwise.
	pub fn tick(&mut self, now: Instant) -> Option<Adaptation> {
		if let Some(last_adapt) = self.last_adapt {
			if now.duration_since(last_adapt) < self.config.adapt_interval {
				return None;
			}
		}
		self.last_adapt = Some(now);

		if self.loss_samples.len() < MIN_SAMPLES_TO_ADAPT {
			return None;
		}

		Some(self.adapt_now())
	}

	/// Seed five samples of `loss_rate` (and defaulted RTT/jitter windows
	/// if empty) and adapt unconditionally, ignoring the tick interval.
	/// Intended for tests and an operator-triggered "degrade now" command.
	pub fn force_adapt(&mut self, loss_rate: f64) -> Adaptation {
		self.loss_samples.clear();
		for _ in 0..5 {
			self.loss_samples.push_back(loss_rate);
		}
		if self.rtt_samples.is_empty() {
			for _ in 0..5 {
				self.rtt_samples.push_back(50.0);
			}
		}
		if self.jitter_samples.is_empty() {
			for _ in 0..5 {
				self.jitter_samples.push_back(10.0);
			}
		}
		self.adapt_now()
	}

	fn adapt_now(&mut self) -> Adaptation {
		let avg_loss = Self::mean(&self.loss_samples);
		let avg_rtt = if self.rtt_samples.is_empty() { 50.0 } else { Self::mean(&self.rtt_samples) };
		let avg_jitter = if self.jitter_samples.is_empty() { 10.0 } else { Self::mean(&self.jitter_samples) };

		let new_bitrate = self.target_bitrate(avg_loss, avg_rtt, avg_jitter);
		let new_protection_ratio = self.target_protection_ratio(avg_loss, avg_rtt);

		let bitrate_changed = new_bitrate != self.current_bitrate;
		let protection_ratio_changed = (new_protection_ratio - self.current_protection_ratio).abs() > 0.02;

		self.current_bitrate = new_bitrate;
		if protection_ratio_changed {
			self.current_protection_ratio = new_protection_ratio;
		}

		Adaptation {
			bitrate: self.current_bitrate,
			bitrate_changed,
			protection_ratio: self.current_protection_ratio,
			protection_ratio_changed,
		}
	}

	fn target_bitrate(&mut self, loss_rate: f64, rtt_ms: f64, jitter_ms: f64) -> u32 {
		let current = self.current_bitrate as f64;
		let mut target = current;

		if loss_rate > 0.10 {
			target = current * 0.7;
			self.stable_count = 0;
		} else if loss_rate > 0.05 {
			target = current * DECREASE_FACTOR;
			self.stable_count = 0;
		} else if loss_rate > 0.02 {
			target = current * 0.95;
			self.stable_count = 0;
		} else if loss_rate < 0.01 && rtt_ms < 100.0 && jitter_ms < 20.0 {
			self.stable_count += 1;
			if self.stable_count >= STABLE_THRESHOLD {
				target = if !self.bandwidth_samples.is_empty() {
					let usage_mbps = Self::mean(&self.bandwidth_samples);
					if usage_mbps < current * 0.8 / 1_000_000.0 {
						current * 1.02
					} else {
						current * INCREASE_FACTOR
					}
				} else {
					current * INCREASE_FACTOR
				};
				self.stable_count = 0;
			}
		}

		if rtt_ms > 200.0 {
			target *= 0.95;
		}
		if jitter_ms > 50.0 {
			target *= 0.95;
		}

		(target.round() as u32).clamp(self.config.min_bitrate, self.config.max_bitrate)
	}

	fn target_protection_ratio(&self, loss_rate: f64, rtt_ms: f64) -> f32 {
		let mut base_fec = loss_rate * 1.5;
		if rtt_ms > 150.0 {
			base_fec *= 1.2;
		} else if rtt_ms < 50.0 {
			base_fec *= 0.9;
		}

		let target = if loss_rate > 0.15 {
			0.4
		} else if loss_rate > 0.10 {
			base_fec.max(0.3)
		} else if loss_rate > 0.05 {
			base_fec.max(0.2)
		} else if loss_rate > 0.02 {
			base_fec.max(0.15)
		} else if loss_rate > 0.01 {
			base_fec.max(0.1)
		} else {
			0.1
		};

		(target as f32).clamp(self.config.min_protection_ratio, self.config.max_protection_ratio)
	}
}
