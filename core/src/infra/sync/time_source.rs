//! Time source abstraction
//!
//! The outbox and the sync engine read the clock only through [`TimeSource`]
//! so tests can drive entry timestamps, backoff deadlines and stale in-flight
//! detection deterministically with [`FakeTimeSource`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Milliseconds since the Unix epoch
pub trait TimeSource: Send + Sync {
	fn now_ms(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
	fn now_ms(&self) -> i64 {
		chrono::Utc::now().timestamp_millis()
	}
}

/// Manually driven clock shared between clones
///
/// ```rust
/// use tether_core::infra::sync::time_source::{FakeTimeSource, TimeSource};
///
/// let time = FakeTimeSource::new(1_000);
/// time.advance(500);
/// assert_eq!(time.now_ms(), 1_500);
/// ```
#[derive(Debug, Clone)]
pub struct FakeTimeSource {
	time: Arc<AtomicI64>,
}

impl Default for FakeTimeSource {
	fn default() -> Self {
		Self::new(1_000)
	}
}

impl FakeTimeSource {
	/// Clock frozen at `initial_ms`
	pub fn new(initial_ms: i64) -> Self {
		Self {
			time: Arc::new(AtomicI64::new(initial_ms)),
		}
	}

	/// Moves the clock forward
	pub fn advance(&self, delta_ms: i64) {
		self.time.fetch_add(delta_ms, Ordering::SeqCst);
	}

	/// Can go backwards to simulate clock skew
	pub fn set(&self, time_ms: i64) {
		self.time.store(time_ms, Ordering::SeqCst);
	}
}

impl TimeSource for FakeTimeSource {
	fn now_ms(&self) -> i64 {
		self.time.load(Ordering::SeqCst)
	}
}
