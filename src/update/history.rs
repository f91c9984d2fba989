use super::state::{SharedUpdate, Status};
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Undo and redo stacks of completed updates, each bounded to `capacity` entries.
///
/// Moving an update between stacks flips its status. Replaying values into the render is up to the caller.
#[derive(Debug)]
pub struct HistoryManager {
	undo: VecDeque<SharedUpdate>,
	redo: VecDeque<SharedUpdate>,
	capacity: usize,
}

impl HistoryManager {
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		Self {
			undo: VecDeque::new(),
			redo: VecDeque::new(),
			capacity: capacity.max(1),
		}
	}

	/// Records a completed update. A new edit invalidates everything that could be redone.
	pub fn push(&mut self, update: SharedUpdate) {
		let status = update.borrow().status;
		if status != Status::Completed {
			return trace!(?status, "Not recording an update that did not complete.");
		}
		self.redo.clear();
		push_bounded(&mut self.undo, update, self.capacity);
	}

	pub fn undo(&mut self) -> Option<SharedUpdate> {
		let update = self.undo.pop_back()?;
		update.borrow_mut().status = Status::Reverted;
		debug!(id = %update.borrow().id, "Undo.");
		push_bounded(&mut self.redo, update.clone(), self.capacity);
		Some(update)
	}

	pub fn redo(&mut self) -> Option<SharedUpdate> {
		let update = self.redo.pop_back()?;
		update.borrow_mut().status = Status::Completed;
		debug!(id = %update.borrow().id, "Redo.");
		push_bounded(&mut self.undo, update.clone(), self.capacity);
		Some(update)
	}

	#[must_use]
	pub fn can_undo(&self) -> bool {
		!self.undo.is_empty()
	}

	#[must_use]
	pub fn can_redo(&self) -> bool {
		!self.redo.is_empty()
	}

	#[must_use]
	pub fn undo_len(&self) -> usize {
		self.undo.len()
	}

	#[must_use]
	pub fn redo_len(&self) -> usize {
		self.redo.len()
	}

	pub fn clear(&mut self) {
		self.undo.clear();
		self.redo.clear();
	}
}

fn push_bounded(stack: &mut VecDeque<SharedUpdate>, update: SharedUpdate, capacity: usize) {
	if stack.len() == capacity {
		stack.pop_front();
	}
	stack.push_back(update);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		source::SourceLocation,
		tree::NodeId,
		update::state::{Operation, Origin, UpdateId, UpdateState},
	};
	use std::{cell::RefCell, rc::Rc};

	fn completed(id: u64) -> SharedUpdate {
		Rc::new(RefCell::new(UpdateState {
			id: UpdateId(id),
			operation: Operation::ClassUpdate,
			location: SourceLocation::new("src/A.tsx", 1, 1),
			node: NodeId(0),
			old_value: format!("old-{}", id),
			new_value: format!("new-{}", id),
			status: Status::Completed,
			retry_count: 0,
			timestamp: 0,
			error: None,
			origin: Origin::Pipeline,
			batch: None,
		}))
	}

	#[test]
	fn undo_redo_flip_status() {
		let mut history = HistoryManager::new(10);
		history.push(completed(1));
		history.push(completed(2));

		let undone = history.undo().unwrap();
		assert_eq!(undone.borrow().id, UpdateId(2));
		assert_eq!(undone.borrow().status, Status::Reverted);
		assert!(history.can_redo());

		let redone = history.redo().unwrap();
		assert!(Rc::ptr_eq(&undone, &redone));
		assert_eq!(redone.borrow().status, Status::Completed);
		assert_eq!(history.undo_len(), 2);
		assert!(history.redo().is_none());
	}

	#[test]
	fn new_edit_clears_redo() {
		let mut history = HistoryManager::new(10);
		history.push(completed(1));
		history.undo();
		history.push(completed(2));
		assert!(!history.can_redo());
	}

	#[test]
	fn bounded() {
		let mut history = HistoryManager::new(2);
		for id in 1..=3 {
			history.push(completed(id));
		}
		assert_eq!(history.undo_len(), 2);
		assert_eq!(history.undo().unwrap().borrow().id, UpdateId(3));
		assert_eq!(history.undo().unwrap().borrow().id, UpdateId(2));
		assert!(history.undo().is_none());
	}

	#[test]
	fn failed_updates_are_not_recorded() {
		let mut history = HistoryManager::new(2);
		let failed = completed(1);
		failed.borrow_mut().status = Status::Failed;
		history.push(failed);
		assert!(!history.can_undo());
	}
}
