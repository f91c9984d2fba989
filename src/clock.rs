use core::{cell::Cell, time::Duration};
use web_time::{Instant, SystemTime, UNIX_EPOCH};

/// Time as seen by timers and message timestamps.
pub trait Clock {
	fn now(&self) -> Instant;
	/// Wall-clock milliseconds since the Unix epoch, for message timestamps.
	fn unix_millis(&self) -> u64;
}

/// The platform clock (`performance.now()` and `Date.now()` in the browser).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}

	#[allow(clippy::cast_possible_truncation)]
	fn unix_millis(&self) -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
	}
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
	origin: Instant,
	origin_unix_millis: u64,
	elapsed: Cell<Duration>,
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new()
	}
}

impl ManualClock {
	#[must_use]
	pub fn new() -> Self {
		Self {
			origin: Instant::now(),
			origin_unix_millis: 1_700_000_000_000,
			elapsed: Cell::new(Duration::ZERO),
		}
	}

	pub fn advance(&self, by: Duration) {
		self.elapsed.set(self.elapsed.get() + by);
	}

	pub fn advance_millis(&self, millis: u64) {
		self.advance(Duration::from_millis(millis));
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Instant {
		self.origin + self.elapsed.get()
	}

	#[allow(clippy::cast_possible_truncation)]
	fn unix_millis(&self) -> u64 {
		self.origin_unix_millis + self.elapsed.get().as_millis() as u64
	}
}
