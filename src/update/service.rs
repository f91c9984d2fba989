//! Validation, optimistic render writes and persistence with bounded retry.

use super::state::{Operation, Origin, PersistError, SharedUpdate, Status, UpdateError, UpdateId, ValidationError};
use crate::{
	config::UpdateConfig,
	namespace::Namespace,
	protocol::EditKind,
	source::SourceLocation,
	tree::{NodeId, RenderTree, TreeError},
};
use futures::future::{FutureExt, LocalBoxFuture};
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, rc::Rc};
use tracing::{debug, info, instrument, trace, warn};

/// One source write, as the persistence collaborator receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
	pub file_path: String,
	pub line: u32,
	pub column: u32,
	pub new_value: String,
	#[serde(rename = "type")]
	pub kind: EditKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub original_value: Option<String>,
}

impl SaveRequest {
	#[must_use]
	pub fn new(location: &SourceLocation, kind: EditKind, new_value: &str, original_value: Option<&str>) -> Self {
		Self {
			file_path: location.file_name.clone(),
			line: location.line_number,
			column: location.column_number,
			new_value: new_value.to_owned(),
			kind,
			original_value: original_value.map(str::to_owned),
		}
	}
}

/// Per-item detail of a batch save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
	pub success: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

/// The external collaborator that patches source files.
pub trait Persistence {
	fn save(&self, request: SaveRequest) -> LocalBoxFuture<'static, Result<(), PersistError>>;
	/// One call for many writes. The result array parallels `requests`.
	fn save_batch(&self, requests: Vec<SaveRequest>) -> LocalBoxFuture<'static, Result<Vec<SaveResult>, PersistError>>;
	/// Whether the content at `location` is a literal that can be edited in place.
	fn check_static(&self, location: &SourceLocation) -> LocalBoxFuture<'static, Result<bool, PersistError>>;
}

/// Removes an id from the in-flight set when dropped, however the attempt ended.
struct InFlightGuard {
	in_flight: Rc<RefCell<HashSet<UpdateId>>>,
	id: UpdateId,
}

impl InFlightGuard {
	fn enter(in_flight: &Rc<RefCell<HashSet<UpdateId>>>, id: UpdateId) -> Result<Self, UpdateError> {
		if in_flight.borrow_mut().insert(id) {
			Ok(Self { in_flight: Rc::clone(in_flight), id })
		} else {
			Err(UpdateError::InFlight(id))
		}
	}
}

impl Drop for InFlightGuard {
	fn drop(&mut self) {
		self.in_flight.borrow_mut().remove(&self.id);
	}
}

pub struct UpdateService {
	tree: Rc<dyn RenderTree>,
	namespace: Rc<Namespace>,
	persistence: Rc<dyn Persistence>,
	config: UpdateConfig,
	in_flight: Rc<RefCell<HashSet<UpdateId>>>,
}

impl core::fmt::Debug for UpdateService {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("UpdateService").field("config", &self.config).field("in_flight", &self.in_flight.borrow().len()).finish_non_exhaustive()
	}
}

impl UpdateService {
	#[must_use]
	pub fn new(tree: Rc<dyn RenderTree>, namespace: Rc<Namespace>, persistence: Rc<dyn Persistence>, config: UpdateConfig) -> Self {
		Self {
			tree,
			namespace,
			persistence,
			config,
			in_flight: Rc::default(),
		}
	}

	#[must_use]
	pub fn persistence(&self) -> &Rc<dyn Persistence> {
		&self.persistence
	}

	#[must_use]
	pub fn is_in_flight(&self, id: UpdateId) -> bool {
		self.in_flight.borrow().contains(&id)
	}

	/// Structural checks. Failures here are never retried.
	///
	/// # Errors
	///
	/// Iff the location is incomplete, the value is too long, or the operation is not a single edit.
	pub fn validate(&self, location: &SourceLocation, operation: &Operation, new_value: &str) -> Result<(), ValidationError> {
		if !location.is_complete() {
			return Err(ValidationError::IncompleteLocation(location.clone()));
		}
		let length = new_value.chars().count();
		if length > self.config.max_value_length {
			return Err(ValidationError::TooLong { length, max: self.config.max_value_length });
		}
		if *operation == Operation::BatchUpdate {
			return Err(ValidationError::NotApplicable(Operation::BatchUpdate));
		}
		Ok(())
	}

	/// Writes `value` into the render between setting and clearing the ignore-mutation marker, so the mutation
	/// observer can tell exactly this write apart from host edits to the same node.
	///
	/// # Errors
	///
	/// Iff the node is gone or the tree refuses the write.
	pub fn write_render(&self, node: NodeId, operation: &Operation, value: &str) -> Result<(), TreeError> {
		let marker = self.namespace.ignore_mutation();
		// The marked span must open with the marker's addition.
		if self.tree.has_attribute(node, marker) {
			self.tree.remove_attribute(node, marker)?;
		}
		self.tree.set_attribute(node, marker, "")?;
		let written = match operation.attribute() {
			Some(attribute) => self.tree.set_attribute(node, attribute, value),
			None => self.tree.set_text_content(node, value),
		};
		if let Err(error) = self.tree.remove_attribute(node, marker) {
			trace!(%error, "Could not clear ignore marker; the observer will.");
		}
		written
	}

	/// Runs one update to a terminal status: validate, write the render, persist, retrying persistence up to the
	/// configured maximum by re-invoking itself with an incremented retry count.
	///
	/// # Errors
	///
	/// Iff the update ends in [`Status::Failed`], with the last error. The error is also recorded on the update.
	pub fn process_update(&self, update: SharedUpdate) -> LocalBoxFuture<'_, Result<(), UpdateError>> {
		async move {
			let id = update.borrow().id;
			let outcome = {
				let _guard = InFlightGuard::enter(&self.in_flight, id)?;
				self.attempt(&update).await
			};
			match outcome {
				Ok(()) => {
					let mut state = update.borrow_mut();
					state.status = Status::Completed;
					state.error = None;
					info!(%id, retries = state.retry_count, "Update completed.");
					Ok(())
				}
				Err(UpdateError::Persist(error)) if update.borrow().retry_count < self.config.max_retries => {
					let retry_count = {
						let mut state = update.borrow_mut();
						state.retry_count += 1;
						state.retry_count
					};
					warn!(%id, %error, retry_count, "Persisting failed; retrying.");
					self.process_update(update).await
				}
				Err(error) => {
					self.fail(&update, &error);
					Err(error)
				}
			}
		}
		.boxed_local()
	}

	#[instrument(skip(self, update), fields(id = %update.borrow().id, retry = update.borrow().retry_count))]
	async fn attempt(&self, update: &SharedUpdate) -> Result<(), UpdateError> {
		let (node, operation, location, new_value, old_value, origin, first_attempt) = {
			let mut state = update.borrow_mut();
			state.status = Status::Processing;
			(state.node, state.operation.clone(), state.location.clone(), state.new_value.clone(), state.old_value.clone(), state.origin, state.retry_count == 0)
		};
		self.validate(&location, &operation, &new_value)?;
		if origin == Origin::Pipeline && first_attempt {
			self.write_render(node, &operation, &new_value)?;
			debug!("Render updated optimistically.");
		}
		let request = SaveRequest::new(&location, operation.edit_kind(), &new_value, Some(&old_value));
		self.persistence.save(request).await?;
		Ok(())
	}

	fn fail(&self, update: &SharedUpdate, error: &UpdateError) {
		let revert = {
			let mut state = update.borrow_mut();
			state.status = Status::Failed;
			state.error = Some(error.to_string());
			warn!(id = %state.id, %error, retries = state.retry_count, "Update failed.");
			state.origin == Origin::Pipeline && matches!(error, UpdateError::Persist(_))
		};
		if revert {
			self.revert(update);
		}
	}

	fn revert(&self, update: &SharedUpdate) {
		let (node, operation, old_value) = {
			let state = update.borrow();
			(state.node, state.operation.clone(), state.old_value.clone())
		};
		if let Err(error) = self.write_render(node, &operation, &old_value) {
			warn!(%error, "Could not restore the render after a failed update.");
		}
	}

	/// Processes `updates` with a single persistence call. They complete or fail together.
	///
	/// Every update is validated and marked in flight before the render is touched. If any is refused, all fail with
	/// that error and neither render nor source changes. Otherwise all complete or fail depending on whether the call
	/// itself succeeded, whatever per-item detail it returns.
	///
	/// # Errors
	///
	/// Iff an update was refused, a render write failed or the persistence call failed.
	#[instrument(skip(self, updates), fields(count = updates.len()))]
	pub async fn process_batch_update(&self, updates: &[SharedUpdate]) -> Result<(), UpdateError> {
		if updates.is_empty() {
			debug!("Nothing to persist.");
			return Ok(());
		}

		let mut guards = Vec::with_capacity(updates.len());
		for update in updates {
			let (id, operation, location, new_value) = {
				let mut state = update.borrow_mut();
				state.status = Status::Processing;
				(state.id, state.operation.clone(), state.location.clone(), state.new_value.clone())
			};
			let admitted = self.validate(&location, &operation, &new_value).map_err(UpdateError::from).and_then(|()| InFlightGuard::enter(&self.in_flight, id));
			match admitted {
				Ok(guard) => guards.push(guard),
				Err(error) => {
					drop(guards);
					warn!(%id, %error, "Batch member refused; failing the whole batch.");
					return Err(self.fail_all(updates, error));
				}
			}
		}

		for (i, update) in updates.iter().enumerate() {
			let (node, operation, new_value, origin) = {
				let state = update.borrow();
				(state.node, state.operation.clone(), state.new_value.clone(), state.origin)
			};
			if origin != Origin::Pipeline {
				continue;
			}
			if let Err(error) = self.write_render(node, &operation, &new_value) {
				updates[..i].iter().filter(|written| written.borrow().origin == Origin::Pipeline).for_each(|written| self.revert(written));
				drop(guards);
				return Err(self.fail_all(updates, error.into()));
			}
		}
		debug!("Render updated optimistically.");

		let requests = updates
			.iter()
			.map(|update| {
				let state = update.borrow();
				SaveRequest::new(&state.location, state.operation.edit_kind(), &state.new_value, Some(&state.old_value))
			})
			.collect();
		let outcome = self.persistence.save_batch(requests).await;
		drop(guards);

		match outcome {
			Ok(results) => {
				let rejected = results.iter().filter(|result| !result.success).count();
				if rejected > 0 {
					warn!(rejected, "Batch persisted, but the collaborator reported per-item failures; keeping all items completed.");
				}
				for update in updates {
					let mut state = update.borrow_mut();
					state.status = Status::Completed;
					state.error = None;
				}
				info!("Batch completed.");
				Ok(())
			}
			Err(error) => Err(self.fail_all(updates, error.into())),
		}
	}

	fn fail_all(&self, updates: &[SharedUpdate], error: UpdateError) -> UpdateError {
		for update in updates {
			self.fail(update, &error);
		}
		error
	}

	/// Writes `value` back to render and source for undo/redo. Never fails; problems are logged.
	pub async fn replay(&self, update: &SharedUpdate, value: &str, original: &str) {
		let (node, operation, location) = {
			let state = update.borrow();
			(state.node, state.operation.clone(), state.location.clone())
		};
		if let Err(error) = self.write_render(node, &operation, value) {
			warn!(%error, "Could not replay value into the render.");
		}
		let request = SaveRequest::new(&location, operation.edit_kind(), value, Some(original));
		if let Err(error) = self.persistence.save(request).await {
			warn!(%error, "Could not persist replayed value.");
		}
	}
}
