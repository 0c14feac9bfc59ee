//! Rate Limiter: per-key token buckets plus one global bucket, with
//! exponential backoff for keys that keep failing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use scout_core::Strng;
use tokio::time::sleep;

use crate::types::RateLimitBucket;

#[derive(Clone, Copy, Debug)]
pub struct ClassLimits {
	pub capacity: f64,
	pub refill_per_second: f64,
}

/// Operation classes, each with its own default bucket shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateClass {
	Test,
	Fetch,
	Geoip,
	Notify,
	Default,
}

impl RateClass {
	fn defaults(self) -> ClassLimits {
		match self {
			RateClass::Test => ClassLimits { capacity: 50.0, refill_per_second: 10.0 },
			RateClass::Fetch => ClassLimits { capacity: 20.0, refill_per_second: 5.0 },
			RateClass::Geoip => ClassLimits { capacity: 10.0, refill_per_second: 2.0 },
			RateClass::Notify => ClassLimits { capacity: 30.0, refill_per_second: 1.0 },
			RateClass::Default => ClassLimits { capacity: 100.0, refill_per_second: 20.0 },
		}
	}
}

const GLOBAL_CAPACITY: f64 = 200.0;
const GLOBAL_REFILL: f64 = 50.0;
const MAX_BACKOFF_SECS: f64 = 300.0;
const BACKOFF_THRESHOLD: u32 = 3;

fn strict_domain_limits(domain: &str) -> Option<ClassLimits> {
	Some(match domain {
		"api.telegram.org" => ClassLimits { capacity: 30.0, refill_per_second: 0.5 },
		"ipapi.co" => ClassLimits { capacity: 10.0, refill_per_second: 0.5 },
		"ipwho.is" => ClassLimits { capacity: 10.0, refill_per_second: 0.5 },
		"ip-api.com" => ClassLimits { capacity: 5.0, refill_per_second: 0.2 },
		_ => return None,
	})
}

/// Extracts the registrable host from a URL-like string, falling back to
/// the input unchanged if it doesn't parse as a URL (a bare hostname key).
pub fn extract_domain(url_or_host: &str) -> String {
	url::Url::parse(url_or_host)
		.ok()
		.and_then(|u| u.host_str().map(String::from))
		.unwrap_or_else(|| url_or_host.to_string())
}

/// Groups an IPv4 address down to its /24 for per-subnet rate limiting;
/// non-IPv4 keys pass through unchanged.
pub fn subnet_key(ip: &str) -> String {
	let parts: Vec<&str> = ip.split('.').collect();
	if parts.len() == 4 {
		format!("{}.{}.{}.0/24", parts[0], parts[1], parts[2])
	} else {
		ip.to_string()
	}
}

struct Inner {
	buckets: HashMap<Strng, RateLimitBucket>,
	global: RateLimitBucket,
}

pub struct RateLimiter {
	inner: Mutex<Inner>,
}

impl Default for RateLimiter {
	fn default() -> Self {
		Self::new()
	}
}

impl RateLimiter {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner {
				buckets: HashMap::new(),
				global: RateLimitBucket::new(GLOBAL_CAPACITY, GLOBAL_REFILL),
			}),
		}
	}

	fn limits_for(key: &str, class: RateClass) -> ClassLimits {
		strict_domain_limits(key).unwrap_or_else(|| class.defaults())
	}

	fn refill(bucket: &mut RateLimitBucket, now: Instant) {
		let elapsed = now.saturating_duration_since(bucket.last_refill_at).as_secs_f64();
		bucket.tokens = (bucket.tokens + elapsed * bucket.refill_per_second).min(bucket.capacity);
		bucket.last_refill_at = now;
	}

	/// Attempts to take `cost` tokens from both the keyed and global
	/// buckets without waiting past `timeout`. Returns `true` if granted.
	pub fn acquire(&self, key: &str, class: RateClass, cost: f64, timeout: Duration) -> bool {
		let now = Instant::now();
		let mut inner = self.inner.lock();

		let limits = Self::limits_for(key, class);
		let bucket = inner
			.buckets
			.entry(Strng::from(key))
			.or_insert_with(|| RateLimitBucket::new(limits.capacity, limits.refill_per_second));

		if let Some(until) = bucket.backoff_until {
			if now < until {
				return false;
			}
		}

		Self::refill(bucket, now);
		Self::refill(&mut inner.global, now);

		let wait_key = if bucket.tokens >= cost {
			0.0
		} else {
			(cost - bucket.tokens) / bucket.refill_per_second.max(f64::EPSILON)
		};
		let wait_global = if inner.global.tokens >= cost {
			0.0
		} else {
			(cost - inner.global.tokens) / inner.global.refill_per_second.max(f64::EPSILON)
		};
		let wait = wait_key.max(wait_global);

		if wait > timeout.as_secs_f64() {
			return false;
		}

		bucket.tokens -= cost;
		inner.global.tokens -= cost;
		true
	}

	/// Loops `acquire` with a 1s retry interval up to a 60s overall
	/// deadline, sleeping between attempts rather than failing the caller.
	pub async fn acquire_or_wait(&self, key: &str, class: RateClass, cost: f64) -> bool {
		let deadline = Instant::now() + Duration::from_secs(60);
		loop {
			if self.acquire(key, class, cost, Duration::ZERO) {
				return true;
			}
			if Instant::now() >= deadline {
				return false;
			}
			sleep(Duration::from_secs(1)).await;
		}
	}

	pub fn record_failure(&self, key: &str) {
		let mut inner = self.inner.lock();
		let bucket = inner
			.buckets
			.entry(Strng::from(key))
			.or_insert_with(|| RateLimitBucket::new(RateClass::Default.defaults().capacity, RateClass::Default.defaults().refill_per_second));
		bucket.failures_since_success += 1;
		if bucket.failures_since_success >= BACKOFF_THRESHOLD {
			let secs = 2f64.powi(bucket.failures_since_success as i32).min(MAX_BACKOFF_SECS);
			bucket.backoff_until = Some(Instant::now() + Duration::from_secs_f64(secs));
		}
	}

	pub fn record_success(&self, key: &str) {
		let mut inner = self.inner.lock();
		if let Some(bucket) = inner.buckets.get_mut(&Strng::from(key)) {
			bucket.failures_since_success = bucket.failures_since_success.saturating_sub(1);
			if bucket.failures_since_success == 0 {
				bucket.backoff_until = None;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn grants_within_capacity() {
		let rl = RateLimiter::new();
		assert!(rl.acquire("host", RateClass::Test, 1.0, Duration::ZERO));
	}

	#[test]
	fn rejects_over_capacity_without_wait_budget() {
		let rl = RateLimiter::new();
		for _ in 0..50 {
			assert!(rl.acquire("host", RateClass::Test, 1.0, Duration::ZERO));
		}
		assert!(!rl.acquire("host", RateClass::Test, 1.0, Duration::ZERO));
	}

	#[test]
	fn backoff_after_repeated_failures() {
		let rl = RateLimiter::new();
		rl.record_failure("flaky");
		rl.record_failure("flaky");
		rl.record_failure("flaky");
		assert!(!rl.acquire("flaky", RateClass::Test, 1.0, Duration::ZERO));
	}

	#[test]
	fn success_decays_failure_count_and_clears_backoff() {
		let rl = RateLimiter::new();
		rl.record_failure("flaky");
		rl.record_failure("flaky");
		rl.record_failure("flaky");
		rl.record_success("flaky");
		rl.record_success("flaky");
		rl.record_success("flaky");
		assert!(rl.acquire("flaky", RateClass::Test, 1.0, Duration::ZERO));
	}

	#[test]
	fn subnet_key_groups_ipv4_by_24() {
		assert_eq!(subnet_key("1.2.3.4"), "1.2.3.0/24");
		assert_eq!(subnet_key("1.2.3.200"), "1.2.3.0/24");
	}

	#[test]
	fn extract_domain_from_url() {
		assert_eq!(extract_domain("https://ipwho.is/1.2.3.4"), "ipwho.is");
	}
}
