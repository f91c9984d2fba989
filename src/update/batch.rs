use core::time::Duration;
use web_time::Instant;

/// Accumulates items until no new one has arrived for `window`.
///
/// Every push restarts the window, so a burst (dragging a slider, say) flushes once, after it ends.
#[derive(Debug)]
pub struct BatchWindow<T> {
	window: Duration,
	deadline: Option<Instant>,
	items: Vec<T>,
}

impl<T> BatchWindow<T> {
	#[must_use]
	pub fn new(window: Duration) -> Self {
		Self { window, deadline: None, items: Vec::new() }
	}

	pub fn push(&mut self, item: T, now: Instant) {
		self.items.push(item);
		self.deadline = Some(now + self.window);
	}

	/// Offers every queued item to `merge` until it folds the new request into one, restarting the window if it did.
	pub fn merge<R>(&mut self, now: Instant, mut merge: impl FnMut(&mut T) -> Option<R>) -> Option<R> {
		let merged = self.items.iter_mut().find_map(|queued| merge(queued));
		if merged.is_some() {
			self.deadline = Some(now + self.window);
		}
		merged
	}

	/// Takes the accumulated items iff the window has elapsed.
	pub fn take_due(&mut self, now: Instant) -> Option<Vec<T>> {
		match self.deadline {
			Some(deadline) if deadline <= now => Some(self.flush()),
			_ => None,
		}
	}

	/// Takes the accumulated items regardless of the window.
	pub fn flush(&mut self) -> Vec<T> {
		self.deadline = None;
		core::mem::take(&mut self.items)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.items.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	#[must_use]
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_request_restarts_window() {
		let start = Instant::now();
		let mut window = BatchWindow::new(Duration::from_millis(300));
		window.push(1, start);
		window.push(2, start + Duration::from_millis(200));
		assert_eq!(window.take_due(start + Duration::from_millis(400)), None);
		assert_eq!(window.take_due(start + Duration::from_millis(500)), Some(vec![1, 2]));
		assert!(window.is_empty());
		assert_eq!(window.deadline(), None);
	}

	#[test]
	fn merge_keeps_one_entry() {
		let start = Instant::now();
		let mut window = BatchWindow::new(Duration::from_millis(100));
		window.push((1, 10), start);
		window.push((2, 5), start);
		let merged = window.merge(start + Duration::from_millis(50), |queued: &mut (u8, u32)| {
			if queued.0 == 1 {
				queued.1 = 20;
				Some(queued.0)
			} else {
				None
			}
		});
		assert_eq!(merged, Some(1));
		assert_eq!(window.merge(start, |_: &mut (u8, u32)| None::<()>), None);
		assert_eq!(window.take_due(start + Duration::from_millis(120)), None);
		assert_eq!(window.take_due(start + Duration::from_millis(150)), Some(vec![(1, 20), (2, 5)]));
	}
}
