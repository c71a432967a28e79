#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;
use wayfarer_domain::UserId;

/// Actions subject to per-user rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
	Typing,
	Message,
	Reaction,
}

impl ActionKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			ActionKind::Typing => "typing",
			ActionKind::Message => "message",
			ActionKind::Reaction => "reaction",
		}
	}
}

/// Bucket settings for one action. Zero burst or refill disables limiting
/// for that action.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterConfig {
	pub burst: u32,
	pub per_minute: u32,
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	touched: Instant,
}

impl TokenBucket {
	fn new(cfg: RateLimiterConfig, now: Instant) -> Option<Self> {
		if cfg.burst == 0 || cfg.per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: cfg.burst as f64,
			tokens: cfg.burst as f64,
			refill_per_sec: cfg.per_minute as f64 / 60.0,
			touched: now,
		})
	}

	fn allow(&mut self, now: Instant) -> bool {
		let elapsed = now.duration_since(self.touched).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
		}
		self.touched = now;
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Injected per-(user, action) limiter.
///
/// Scoped to the session handler's dependency graph rather than module
/// state; idle buckets are reclaimed by the sweep task.
#[derive(Clone)]
pub struct RateLimiter {
	inner: Arc<Mutex<HashMap<(String, ActionKind), TokenBucket>>>,
	settings: Arc<HashMap<ActionKind, RateLimiterConfig>>,
	idle_expiry: Duration,
}

impl RateLimiter {
	pub fn new(settings: HashMap<ActionKind, RateLimiterConfig>, idle_expiry: Duration) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HashMap::new())),
			settings: Arc::new(settings),
			idle_expiry,
		}
	}

	/// True when the action is within budget; false drops it.
	pub async fn allow(&self, user: &UserId, action: ActionKind) -> bool {
		self.allow_at(user, action, Instant::now()).await
	}

	async fn allow_at(&self, user: &UserId, action: ActionKind, now: Instant) -> bool {
		let Some(cfg) = self.settings.get(&action).copied() else {
			return true;
		};

		let mut buckets = self.inner.lock().await;
		let key = (user.as_str().to_string(), action);
		match buckets.get_mut(&key) {
			Some(bucket) => bucket.allow(now),
			None => match TokenBucket::new(cfg, now) {
				Some(mut bucket) => {
					let allowed = bucket.allow(now);
					buckets.insert(key, bucket);
					allowed
				}
				None => true,
			},
		}
	}

	/// Drop buckets idle longer than the expiry window.
	pub async fn sweep(&self) {
		self.sweep_at(Instant::now()).await;
	}

	async fn sweep_at(&self, now: Instant) {
		let mut buckets = self.inner.lock().await;
		let before = buckets.len();
		buckets.retain(|_, bucket| now.duration_since(bucket.touched) < self.idle_expiry);
		let dropped = before - buckets.len();
		if dropped > 0 {
			debug!(dropped, remaining = buckets.len(), "rate limiter: swept idle buckets");
		}
	}

	pub async fn tracked_buckets(&self) -> usize {
		self.inner.lock().await.len()
	}
}

/// Periodic expiry sweep; aborts with its owner.
pub fn spawn_rate_limit_sweeper(limiter: RateLimiter, every: Duration) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(every);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tick.tick().await;
			limiter.sweep().await;
		}
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).expect("valid user id")
	}

	fn limiter(burst: u32, per_minute: u32, idle: Duration) -> RateLimiter {
		let mut settings = HashMap::new();
		settings.insert(ActionKind::Typing, RateLimiterConfig { burst, per_minute });
		RateLimiter::new(settings, idle)
	}

	#[tokio::test]
	async fn burst_allows_n_then_denies() {
		let limiter = limiter(3, 60, Duration::from_secs(300));
		let user = uid("u1");
		let now = Instant::now();

		for _ in 0..3 {
			assert!(limiter.allow_at(&user, ActionKind::Typing, now).await);
		}
		assert!(!limiter.allow_at(&user, ActionKind::Typing, now).await);
	}

	#[tokio::test]
	async fn refill_restores_budget() {
		let limiter = limiter(1, 60, Duration::from_secs(300));
		let user = uid("u1");
		let now = Instant::now();

		assert!(limiter.allow_at(&user, ActionKind::Typing, now).await);
		assert!(!limiter.allow_at(&user, ActionKind::Typing, now).await);

		// 60/min refills one token per second.
		assert!(limiter.allow_at(&user, ActionKind::Typing, now + Duration::from_secs(1)).await);
	}

	#[tokio::test]
	async fn users_and_actions_have_independent_buckets() {
		let mut settings = HashMap::new();
		settings.insert(ActionKind::Typing, RateLimiterConfig { burst: 1, per_minute: 60 });
		settings.insert(ActionKind::Reaction, RateLimiterConfig { burst: 1, per_minute: 60 });
		let limiter = RateLimiter::new(settings, Duration::from_secs(300));
		let now = Instant::now();

		assert!(limiter.allow_at(&uid("u1"), ActionKind::Typing, now).await);
		assert!(!limiter.allow_at(&uid("u1"), ActionKind::Typing, now).await);

		// Different user and different action are unaffected.
		assert!(limiter.allow_at(&uid("u2"), ActionKind::Typing, now).await);
		assert!(limiter.allow_at(&uid("u1"), ActionKind::Reaction, now).await);
	}

	#[tokio::test]
	async fn unconfigured_actions_are_unlimited() {
		let limiter = limiter(1, 60, Duration::from_secs(300));
		let user = uid("u1");
		for _ in 0..100 {
			assert!(limiter.allow(&user, ActionKind::Message).await);
		}
		assert_eq!(limiter.tracked_buckets().await, 0);
	}

	#[tokio::test]
	async fn sweep_drops_idle_buckets_only() {
		let limiter = limiter(3, 60, Duration::from_secs(10));
		let now = Instant::now();

		limiter.allow_at(&uid("idle"), ActionKind::Typing, now).await;
		limiter
			.allow_at(&uid("fresh"), ActionKind::Typing, now + Duration::from_secs(15))
			.await;
		assert_eq!(limiter.tracked_buckets().await, 2);

		limiter.sweep_at(now + Duration::from_secs(16)).await;
		assert_eq!(limiter.tracked_buckets().await, 1);
	}
}
