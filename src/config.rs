//! Runtime tunables.
//!
//! The host deserializes these from its global configuration object; every field has a default.

use core::time::Duration;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// Marker prefix, taking precedence over an injected tag.
	pub attribute_prefix: Option<String>,
	/// Surfaces bridge-send failures on a connected channel as errors instead of only logging them.
	pub development: bool,
	pub bridge: BridgeConfig,
	pub update: UpdateConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			attribute_prefix: None,
			development: cfg!(debug_assertions),
			bridge: BridgeConfig::default(),
			update: UpdateConfig::default(),
		}
	}
}

impl Config {
	/// # Errors
	///
	/// Iff `json` is not a valid configuration object.
	pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(json)
	}
}

/// Durations are given in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
	/// Delay before an embedded page considers itself connected and announces readiness.
	#[serde(with = "millis")]
	pub ready_grace: Duration,
	/// How long an embedded page holds outgoing messages while waiting for the handshake.
	#[serde(with = "millis")]
	pub ready_wait: Duration,
	#[serde(with = "millis")]
	pub heartbeat_interval: Duration,
	/// Silence after which a connected link is considered dropped.
	#[serde(with = "millis")]
	pub stale_after: Duration,
	#[serde(with = "millis")]
	pub request_timeout: Duration,
	/// Consecutive heartbeat or health failures before a connected link is reported degraded.
	pub degraded_after_failures: u32,
}

impl Default for BridgeConfig {
	fn default() -> Self {
		Self {
			ready_grace: Duration::from_millis(100),
			ready_wait: Duration::from_millis(1000),
			heartbeat_interval: Duration::from_millis(5000),
			stale_after: Duration::from_millis(15_000),
			request_timeout: Duration::from_millis(5000),
			degraded_after_failures: 3,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateConfig {
	/// Retries after the first failed persistence attempt.
	pub max_retries: u32,
	/// Longest accepted value, in characters.
	pub max_value_length: usize,
	/// Idle window that groups discrete edit requests into one batch.
	#[serde(with = "millis")]
	pub batch_window: Duration,
	/// Most undo (and redo) entries kept.
	pub history_capacity: usize,
}

impl Default for UpdateConfig {
	fn default() -> Self {
		Self {
			max_retries: 3,
			max_value_length: 10_000,
			batch_window: Duration::from_millis(300),
			history_capacity: 100,
		}
	}
}

mod millis {
	use core::time::Duration;
	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
