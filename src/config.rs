//! Typed configuration (C0), loaded from a TOML file with every field
//! defaulted so a bare `[fec]` / `[jitter]` / `[controller]` section (or
//! none at all) is enough to start.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Local address to bind the media socket to.
	pub address: String,

	/// Local UDP port to bind the media socket to.
	pub port: u16,

	#[serde(default)]
	pub fec: FecConfig,

	#[serde(default)]
	pub jitter: JitterConfig,

	#[serde(default)]
	pub controller: ControllerConfig,
}

impl Config {
	#[allow(clippy::result_unit_err)]
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<Config, ()> {
		let config = std::fs::read_to_string(file).map_err(|e| tracing::error!("failed to open configuration file: {e}"))?;
		let config: Config = toml::from_str(&config).map_err(|e| tracing::error!("failed to parse configuration file: {e}"))?;

		Ok(config)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			address: "0.0.0.0".to_string(),
			port: 5004,
			fec: Default::default(),
			jitter: Default::default(),
			controller: Default::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FecConfig {
	/// `G`: media packets per FEC group. Must be in `1..=10` — the parity
	/// header only has room for 10 coefficients.
	pub group_size: usize,

	pub enable_red: bool,

	/// Initial protection ratio, used until the controller's first tick.
	pub initial_protection_ratio: f32,
	pub min_protection_ratio: f32,
	pub max_protection_ratio: f32,
}

impl Default for FecConfig {
	fn default() -> Self {
		Self {
			group_size: 10,
			enable_red: true,
			initial_protection_ratio: 0.3,
			min_protection_ratio: 0.1,
			max_protection_ratio: 0.5,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JitterConfig {
	pub target_delay_ms: u32,
	pub max_delay_ms: u32,
	pub reorder_tolerance: u16,
}

impl Default for JitterConfig {
	fn default() -> Self {
		Self { target_delay_ms: 100, max_delay_ms: 500, reorder_tolerance: 5 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
	pub initial_bitrate: u32,
	pub min_bitrate: u32,
	pub max_bitrate: u32,

	#[serde(with = "duration_secs")]
	pub adapt_interval: Duration,
}

impl Default for ControllerConfig {
	fn default() -> Self {
		Self {
			initial_bitrate: 2_500_000,
			min_bitrate: 500_000,
			max_bitrate: 8_000_000,
			adapt_interval: Duration::from_secs(2),
		}
	}
}

impl From<&Config> for crate::controller::ControllerConfig {
	fn from(config: &Config) -> Self {
		Self {
			initial_bitrate: config.controller.initial_bitrate,
			min_bitrate: config.controller.min_bitrate,
			max_bitrate: config.controller.max_bitrate,
			min_protection_ratio: config.fec.min_protection_ratio,
			max_protection_ratio: config.fec.max_protection_ratio,
			adapt_interval: config.controller.adapt_interval,
		}
	}
}

/// Manual (de)serializer so `adapt_interval` reads as a plain integer
/// number of seconds in TOML instead of a nested struct.
mod duration_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let secs = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(secs))
	}
}
