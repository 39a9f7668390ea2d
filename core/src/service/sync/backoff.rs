//! Exponential backoff with jitter

use crate::config::SyncConfig;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
	pub base_ms: u64,
	pub max_ms: u64,
	pub jitter_ratio: f64,
}

impl Backoff {
	/// Backoff using the configured base delay, cap and jitter
	pub fn from_config(config: &SyncConfig) -> Self {
		Self {
			base_ms: config.base_delay_ms,
			max_ms: config.max_delay_ms,
			jitter_ratio: config.jitter_ratio,
		}
	}

	/// `min(max, base * 2^retry_count)`, where `retry_count` counts failures
	/// before the one being scheduled
	pub fn delay_ms(&self, retry_count: u32) -> u64 {
		let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
		self.base_ms.saturating_mul(factor).min(self.max_ms)
	}

	/// Delay with up to `jitter_ratio` of it randomly removed
	///
	/// Jitter only ever shortens the delay, so the result never exceeds the cap.
	pub fn jittered_ms<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> u64 {
		let delay = self.delay_ms(retry_count);
		if self.jitter_ratio <= 0.0 || delay == 0 {
			return delay;
		}

		let spread = (delay as f64 * self.jitter_ratio.min(1.0)) as u64;
		if spread == 0 {
			return delay;
		}
		delay - rng.gen_range(0..=spread)
	}
}
