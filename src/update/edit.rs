//! Turns raw interactions into [`UpdateState`]s, capturing the old value before anything is written.

use super::state::{Operation, Origin, Status, UpdateId, UpdateState};
use crate::{
	clock::Clock,
	resolver::SourceResolver,
	source::SourceLocation,
	tree::NodeId,
};
use hashbrown::HashSet;
use std::{
	cell::{Cell, RefCell},
	rc::Rc,
};
use tracing::{debug, instrument, trace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
	#[error("node {0:?} has no resolvable source location")]
	Unattributed(NodeId),
	#[error("content at {0} is computed, not a literal; refusing to edit it")]
	NotStaticContent(SourceLocation),
	#[error("class at {0} is computed, not a literal; refusing to edit it")]
	NotStaticClass(SourceLocation),
	#[error("node {0:?} is no longer part of the render tree")]
	Detached(NodeId),
	#[error("new value equals the current value")]
	Unchanged,
	#[error("{0:?} is not an edit of a single node")]
	NotSingleNode(Operation),
}

pub struct EditManager {
	resolver: SourceResolver,
	clock: Rc<dyn Clock>,
	next_id: Cell<u64>,
	confirmed_static: RefCell<HashSet<SourceLocation>>,
}

impl core::fmt::Debug for EditManager {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("EditManager").field("next_id", &self.next_id).finish_non_exhaustive()
	}
}

impl EditManager {
	#[must_use]
	pub fn new(resolver: SourceResolver, clock: Rc<dyn Clock>) -> Self {
		Self {
			resolver,
			clock,
			next_id: Cell::new(1),
			confirmed_static: RefCell::default(),
		}
	}

	/// Records that the persistence collaborator vouched for `location`'s content being a literal.
	pub fn confirm_static(&self, location: SourceLocation) {
		self.confirmed_static.borrow_mut().insert(location);
	}

	/// Whether content edits of `node` may be written back to source.
	#[must_use]
	pub fn is_content_editable(&self, node: NodeId, location: &SourceLocation) -> bool {
		self.resolver.is_static_content(node) || self.confirmed_static.borrow().contains(location)
	}

	/// Captures a pipeline edit of `node`.
	///
	/// # Errors
	///
	/// Iff the node is gone, has no source location, the new value is unchanged, or the edit would write a computed
	/// value back to source.
	#[instrument(skip(self, new_value))]
	pub fn capture(&self, node: NodeId, operation: Operation, new_value: &str) -> Result<UpdateState, EditError> {
		let location = self.resolver.resolve(node).ok_or(EditError::Unattributed(node))?;
		let old_value = self.current_value(node, &operation)?;
		if old_value == new_value {
			return Err(EditError::Unchanged);
		}
		self.check_editable(node, &operation, &location)?;
		Ok(self.build(node, operation, location, old_value, new_value.to_owned(), Origin::Pipeline))
	}

	/// Captures an edit the render already shows, for example one made by the host page directly.
	///
	/// # Errors
	///
	/// As [`capture`](`EditManager::capture`), except that the current value is the new one.
	#[instrument(skip(self, old_value))]
	pub fn capture_observed(&self, node: NodeId, operation: Operation, old_value: String) -> Result<UpdateState, EditError> {
		let location = self.resolver.resolve(node).ok_or(EditError::Unattributed(node))?;
		let new_value = self.current_value(node, &operation)?;
		if old_value == new_value {
			return Err(EditError::Unchanged);
		}
		self.check_editable(node, &operation, &location)?;
		Ok(self.build(node, operation, location, old_value, new_value, Origin::Observed))
	}

	/// What the render currently shows for `operation`'s target on `node`.
	///
	/// # Errors
	///
	/// Iff the node is gone or `operation` does not target a single node.
	pub fn current_value(&self, node: NodeId, operation: &Operation) -> Result<String, EditError> {
		let tree = self.resolver.tree();
		if !tree.contains(node) {
			return Err(EditError::Detached(node));
		}
		match operation {
			Operation::ContentUpdate => Ok(tree.text_content(node).unwrap_or_default()),
			Operation::BatchUpdate => Err(EditError::NotSingleNode(Operation::BatchUpdate)),
			attribute_operation => Ok(attribute_operation.attribute().and_then(|name| tree.attribute(node, name)).unwrap_or_default()),
		}
	}

	fn check_editable(&self, node: NodeId, operation: &Operation, location: &SourceLocation) -> Result<(), EditError> {
		match operation {
			Operation::ContentUpdate if !self.is_content_editable(node, location) => Err(EditError::NotStaticContent(location.clone())),
			Operation::ClassUpdate if self.resolver.tree().attribute(node, self.resolver.namespace().static_class()).as_deref() == Some("false") => {
				Err(EditError::NotStaticClass(location.clone()))
			}
			_ => Ok(()),
		}
	}

	fn build(&self, node: NodeId, operation: Operation, location: SourceLocation, old_value: String, new_value: String, origin: Origin) -> UpdateState {
		let id = UpdateId(self.next_id.get());
		self.next_id.set(id.0 + 1);
		debug!(%id, ?operation, %location, ?origin, "Captured edit.");
		if cfg!(feature = "dangerous-logging") {
			trace!(%id, %old_value, %new_value);
		} else {
			trace!(%id, old_len = old_value.len(), new_len = new_value.len());
		}
		UpdateState {
			id,
			operation,
			location,
			node,
			old_value,
			new_value,
			status: Status::Pending,
			retry_count: 0,
			timestamp: self.clock.unix_millis(),
			error: None,
			origin,
			batch: None,
		}
	}
}
