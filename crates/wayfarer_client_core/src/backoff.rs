#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;

/// Reconnect backoff policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// Attempts beyond this surface a terminal error and reset the counter.
	pub max_attempts: u32,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(1000),
			max_delay: Duration::from_millis(30_000),
			max_attempts: 8,
		}
	}
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(max_delay, base_delay * 2^attempt)` plus up to one second of jitter.
pub fn backoff_delay(attempt: u32, cfg: &BackoffConfig) -> Duration {
	let base_ms = cfg.base_delay.as_millis() as u64;
	let max_ms = cfg.max_delay.as_millis() as u64;

	let pow = 2u64.saturating_pow(attempt.min(20));
	let delay_ms = base_ms.saturating_mul(pow).min(max_ms);

	let jitter_ms = rand::rng().random_range(0..1000);
	Duration::from_millis(delay_ms.saturating_add(jitter_ms))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uncapped_attempts_fall_in_the_doubling_window() {
		let cfg = BackoffConfig {
			base_delay: Duration::from_millis(1000),
			max_delay: Duration::from_millis(30_000),
			max_attempts: 8,
		};

		for attempt in 1..=4u32 {
			let expected = 1000u64 * 2u64.pow(attempt);
			for _ in 0..64 {
				let ms = backoff_delay(attempt, &cfg).as_millis() as u64;
				assert!(
					(expected..expected + 1000).contains(&ms),
					"attempt {attempt}: {ms}ms outside [{expected}, {})",
					expected + 1000
				);
			}
		}
	}

	#[test]
	fn capped_attempts_sit_on_the_ceiling_plus_jitter() {
		let cfg = BackoffConfig {
			base_delay: Duration::from_millis(1000),
			max_delay: Duration::from_millis(30_000),
			max_attempts: 8,
		};

		// 2^5 * 1000 = 32000 > cap, so attempt 5 onward is capped.
		for attempt in [5u32, 6, 12] {
			for _ in 0..64 {
				let ms = backoff_delay(attempt, &cfg).as_millis() as u64;
				assert!((30_000..31_000).contains(&ms), "attempt {attempt}: {ms}ms outside [30000, 31000)");
			}
		}
	}

	#[test]
	fn huge_attempt_numbers_do_not_overflow() {
		let cfg = BackoffConfig::default();
		let ms = backoff_delay(u32::MAX, &cfg).as_millis() as u64;
		assert!((30_000..31_000).contains(&ms));
	}
}
