//! Yield-then-sleep backoff shared by every blocking acquisition.

use crate::config::LatchConfig;
use crate::sync::thread;

/// Spin wait with a fixed yield budget.
///
/// Each call to [`Backoff::snooze`] yields the CPU until the budget runs out.
/// The budget is then refilled and, when sleeping is enabled, the thread
/// sleeps once before the next round. There is no upper bound on the number
/// of rounds; callers decide when to stop.
pub(crate) struct Backoff<'c> {
	config: &'c LatchConfig,
	limit: u32,
	remaining: u32,
}

impl<'c> Backoff<'c> {
	pub(crate) fn shared(config: &'c LatchConfig) -> Self {
		Self::with_limit(config, config.shared_yield_limit)
	}

	pub(crate) fn exclusive(config: &'c LatchConfig) -> Self {
		Self::with_limit(config, config.exclusive_yield_limit)
	}

	fn with_limit(config: &'c LatchConfig, limit: u32) -> Self {
		Backoff {
			config,
			limit,
			remaining: limit,
		}
	}

	/// Waits a little. Returns `true` when this call closed a round.
	#[inline]
	pub(crate) fn snooze(&mut self) -> bool {
		if self.remaining > 0 {
			self.remaining -= 1;
			thread::yield_now();
			false
		} else {
			self.remaining = self.limit;
			if self.config.use_sleep {
				thread::sleep(self.config.sleep_interval);
			}
			true
		}
	}
}

#[cfg(all(test, not(loom)))]
mod tests {
	use super::*;
	use std::time::{Duration, Instant};

	#[test]
	fn round_closes_after_budget() {
		let config = LatchConfig::DEFAULT.with_yield_limits(3, 2);

		let mut backoff = Backoff::exclusive(&config);
		let rounds: Vec<bool> = (0..6).map(|_| backoff.snooze()).collect();
		assert_eq!(rounds, [false, false, true, false, false, true]);

		let mut backoff = Backoff::shared(&config);
		let rounds: Vec<bool> = (0..4).map(|_| backoff.snooze()).collect();
		assert_eq!(rounds, [false, false, false, true]);
	}

	#[test]
	fn zero_budget_closes_every_call() {
		let config = LatchConfig::DEFAULT.with_yield_limits(0, 0);
		let mut backoff = Backoff::shared(&config);
		assert!(backoff.snooze());
		assert!(backoff.snooze());
	}

	#[test]
	fn sleeps_only_when_enabled() {
		let config = LatchConfig::DEFAULT.with_yield_limits(0, 0).with_sleep(Duration::from_millis(5));
		let mut backoff = Backoff::exclusive(&config);

		let start = Instant::now();
		for _ in 0..3 {
			backoff.snooze();
		}
		assert!(start.elapsed() >= Duration::from_millis(15));
	}
}
