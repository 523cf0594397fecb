//! Tunables for the latch backoff loops.
//!
//! The latch itself stores nothing but its word and cleanup gate, so these
//! values are passed to every acquiring operation. A process normally builds
//! one [`LatchConfig`] at startup, either from [`LatchConfig::DEFAULT`] or by
//! deserializing it from its own configuration file, and shares it by
//! reference.
//!
//! Durations are serialized as integer milliseconds:
//!
//! ```
//! use sxlatch::LatchConfig;
//!
//! let config: LatchConfig = serde_json::from_str(r#"{ "use_sleep": true, "sleep_interval": 2 }"#).unwrap();
//! assert!(config.use_sleep);
//! assert_eq!(config.sleep_interval, std::time::Duration::from_millis(2));
//! assert_eq!(config.exclusive_yield_limit, LatchConfig::DEFAULT.exclusive_yield_limit);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Yields per backoff round on the shared paths.
const SHARED_YIELD_LIMIT: u32 = 100_000;

/// Yields per backoff round on the exclusive paths. Writers expect shorter
/// waits than readers, so they get to their sleep sooner.
const EXCLUSIVE_YIELD_LIMIT: u32 = 10;

/// Backoff and lifecycle settings shared by all latches of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatchConfig {
	/// Number of `yield_now` calls in one backoff round for shared acquisitions.
	pub shared_yield_limit: u32,

	/// Number of `yield_now` calls in one backoff round for exclusive acquisitions.
	pub exclusive_yield_limit: u32,

	/// Sleep for `sleep_interval` after each exhausted backoff round instead of
	/// spinning straight into the next one.
	pub use_sleep: bool,

	#[serde(with = "millis")]
	pub sleep_interval: Duration,

	/// Upper bound on the wait of the interruptible variants. `None` means
	/// they wait until interrupted.
	#[serde(with = "opt_millis")]
	pub interruptible_timeout: Option<Duration>,

	/// Upper bound on how long [`crate::Latch::destroy`] waits for a cleanup.
	#[serde(with = "millis")]
	pub destroy_timeout: Duration,

	#[serde(with = "millis")]
	pub destroy_poll_interval: Duration,
}

impl LatchConfig {
	pub const DEFAULT: LatchConfig = LatchConfig {
		shared_yield_limit: SHARED_YIELD_LIMIT,
		exclusive_yield_limit: EXCLUSIVE_YIELD_LIMIT,
		use_sleep: false,
		sleep_interval: Duration::from_millis(1),
		interruptible_timeout: None,
		destroy_timeout: Duration::from_secs(1),
		destroy_poll_interval: Duration::from_millis(1),
	};

	pub fn with_yield_limits(mut self, shared: u32, exclusive: u32) -> Self {
		self.shared_yield_limit = shared;
		self.exclusive_yield_limit = exclusive;
		self
	}

	pub fn with_sleep(mut self, interval: Duration) -> Self {
		self.use_sleep = true;
		self.sleep_interval = interval;
		self
	}

	pub fn with_interruptible_timeout(mut self, timeout: Duration) -> Self {
		self.interruptible_timeout = Some(timeout);
		self
	}

	pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
		self.destroy_timeout = timeout;
		self
	}
}

impl Default for LatchConfig {
	fn default() -> Self {
		Self::DEFAULT
	}
}

mod millis {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

mod opt_millis {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(
		duration: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match duration {
			Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
	}
}
