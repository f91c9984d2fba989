//! The edit pipeline: capture → validate → apply to render → persist → record in history.
//!
//! [`UpdateManager`] ties the pieces together. Direct calls, batched requests and mutations observed in the render tree
//! all enter through the same [`EditManager`] capture functions and end up in one history.

pub mod batch;
pub mod edit;
pub mod history;
pub mod observer;
pub mod service;
pub mod state;

pub use self::{
	batch::BatchWindow,
	edit::{EditError, EditManager},
	history::HistoryManager,
	observer::ObserverManager,
	service::{Persistence, SaveRequest, SaveResult, UpdateService},
	state::{Modification, Operation, Origin, PersistError, SharedUpdate, Status, UpdateError, UpdateId, UpdateState, ValidationError},
};

use crate::{
	clock::Clock,
	config::UpdateConfig,
	matcher::InstanceMatcher,
	protocol::ErrorCode,
	resolver::SourceResolver,
	tree::NodeId,
};
use std::{
	cell::{Cell, RefCell},
	rc::Rc,
};
use tracing::{debug, instrument, trace};

/// Lifecycle notifications, carrying a snapshot of the update at that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
	Started(UpdateState),
	Completed(UpdateState),
	Failed { update: UpdateState, code: ErrorCode },
	Reverted(UpdateState),
	Reapplied(UpdateState),
}

type Listener = Rc<dyn Fn(&UpdateEvent)>;

pub struct UpdateManager {
	resolver: SourceResolver,
	matcher: InstanceMatcher,
	edits: EditManager,
	service: UpdateService,
	history: RefCell<HistoryManager>,
	observer: ObserverManager,
	batch: RefCell<BatchWindow<SharedUpdate>>,
	next_batch: Cell<u64>,
	updates: RefCell<Vec<SharedUpdate>>,
	listeners: RefCell<Vec<(u64, Listener)>>,
	next_listener: Cell<u64>,
	clock: Rc<dyn Clock>,
}

impl core::fmt::Debug for UpdateManager {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("UpdateManager")
			.field("updates", &self.updates.borrow().len())
			.field("history", &self.history.borrow())
			.field("queued", &self.batch.borrow().len())
			.finish_non_exhaustive()
	}
}

impl UpdateManager {
	#[must_use]
	pub fn new(resolver: SourceResolver, persistence: Rc<dyn Persistence>, config: &UpdateConfig, clock: Rc<dyn Clock>) -> Self {
		let namespace = resolver.namespace_rc();
		let tree = resolver.tree_rc();
		Self {
			matcher: InstanceMatcher::new(resolver.clone()),
			edits: EditManager::new(resolver.clone(), Rc::clone(&clock)),
			service: UpdateService::new(tree, namespace, persistence, config.clone()),
			history: RefCell::new(HistoryManager::new(config.history_capacity)),
			observer: ObserverManager::new(resolver.clone()),
			batch: RefCell::new(BatchWindow::new(config.batch_window)),
			next_batch: Cell::new(1),
			updates: RefCell::default(),
			listeners: RefCell::default(),
			next_listener: Cell::new(1),
			resolver,
			clock,
		}
	}

	#[must_use]
	pub fn resolver(&self) -> &SourceResolver {
		&self.resolver
	}

	#[must_use]
	pub fn matcher(&self) -> &InstanceMatcher {
		&self.matcher
	}

	#[must_use]
	pub fn edits(&self) -> &EditManager {
		&self.edits
	}

	#[must_use]
	pub fn service(&self) -> &UpdateService {
		&self.service
	}

	#[must_use]
	pub fn observer(&self) -> &ObserverManager {
		&self.observer
	}

	/// Registers a lifecycle listener and returns its id for [`unsubscribe`](`UpdateManager::unsubscribe`).
	pub fn subscribe(&self, listener: impl Fn(&UpdateEvent) + 'static) -> u64 {
		let id = self.next_listener.get();
		self.next_listener.set(id + 1);
		self.listeners.borrow_mut().push((id, Rc::new(listener)));
		id
	}

	pub fn unsubscribe(&self, id: u64) {
		self.listeners.borrow_mut().retain(|(listener_id, _)| *listener_id != id);
	}

	fn emit(&self, event: &UpdateEvent) {
		let listeners: Vec<Listener> = self.listeners.borrow().iter().map(|(_, listener)| listener.clone()).collect();
		for listener in listeners {
			listener(event);
		}
	}

	fn register(&self, update: UpdateState) -> SharedUpdate {
		let update = Rc::new(RefCell::new(update));
		self.updates.borrow_mut().push(update.clone());
		update
	}

	/// Every update this manager created, oldest first.
	#[must_use]
	pub fn updates(&self) -> Vec<UpdateState> {
		self.updates.borrow().iter().map(|update| update.borrow().clone()).collect()
	}

	#[must_use]
	pub fn get(&self, id: UpdateId) -> Option<UpdateState> {
		self.updates.borrow().iter().find(|update| update.borrow().id == id).map(|update| update.borrow().clone())
	}

	/// The display log of completed updates.
	#[must_use]
	pub fn modifications(&self) -> Vec<Modification> {
		self.updates.borrow().iter().map(|update| update.borrow()).filter(|update| update.status == Status::Completed).map(|update| Modification::from(&*update)).collect()
	}

	#[must_use]
	pub fn can_undo(&self) -> bool {
		self.history.borrow().can_undo()
	}

	#[must_use]
	pub fn can_redo(&self) -> bool {
		self.history.borrow().can_redo()
	}

	/// Captures and fully processes one edit.
	///
	/// # Errors
	///
	/// Iff the edit could not be captured or ended in [`Status::Failed`].
	#[instrument(skip(self, new_value))]
	pub async fn update(&self, node: NodeId, operation: Operation, new_value: &str) -> Result<UpdateState, UpdateError> {
		let update = self.edits.capture(node, operation, new_value)?;
		self.run(self.register(update)).await
	}

	/// # Errors
	///
	/// See [`update`](`UpdateManager::update`).
	pub async fn update_content(&self, node: NodeId, new_content: &str) -> Result<UpdateState, UpdateError> {
		self.update(node, Operation::ContentUpdate, new_content).await
	}

	/// # Errors
	///
	/// See [`update`](`UpdateManager::update`).
	pub async fn update_class(&self, node: NodeId, new_class: &str) -> Result<UpdateState, UpdateError> {
		self.update(node, Operation::ClassUpdate, new_class).await
	}

	/// # Errors
	///
	/// See [`update`](`UpdateManager::update`).
	pub async fn update_style(&self, node: NodeId, new_style: &str) -> Result<UpdateState, UpdateError> {
		self.update(node, Operation::StyleUpdate, new_style).await
	}

	async fn run(&self, update: SharedUpdate) -> Result<UpdateState, UpdateError> {
		self.emit(&UpdateEvent::Started(update.borrow().clone()));
		let result = self.service.process_update(update.clone()).await;
		self.settle(&update, result.as_ref().err());
		result.map(|()| update.borrow().clone())
	}

	fn settle(&self, update: &SharedUpdate, error: Option<&UpdateError>) {
		let snapshot = update.borrow().clone();
		match (snapshot.status, error) {
			(Status::Completed, _) => {
				self.history.borrow_mut().push(update.clone());
				self.emit(&UpdateEvent::Completed(snapshot));
			}
			(Status::Failed, error) => {
				let code = error.map_or(ErrorCode::Internal, UpdateError::code);
				self.emit(&UpdateEvent::Failed { update: snapshot, code });
			}
			(status, _) => trace!(?status, "Update left without terminal status."),
		}
	}

	/// Applies `operation` to every rendered instance of `node`'s source position, persisting them with one call.
	///
	/// Content edits only reach instances whose static-content flag agrees with `node`'s.
	///
	/// # Errors
	///
	/// Iff `node` itself could not be captured or the persistence call failed.
	#[instrument(skip(self, new_value))]
	pub async fn update_everywhere(&self, node: NodeId, operation: Operation, new_value: &str) -> Result<Vec<UpdateState>, UpdateError> {
		let location = self.resolver.resolve(node).ok_or(EditError::Unattributed(node))?;
		let instances = if operation == Operation::ContentUpdate {
			self.matcher.find_content_instances(node, &location)
		} else {
			self.matcher.find_instances(node, &location)
		};
		let mut captured = Vec::with_capacity(instances.len());
		for instance in instances {
			match self.edits.capture(instance, operation.clone(), new_value) {
				Ok(update) => captured.push(update),
				Err(error) if instance == node => return Err(error.into()),
				Err(error) => debug!(?instance, %error, "Skipping instance."),
			}
		}
		self.process_batch(captured).await
	}

	/// Processes already captured updates with one persistence call. They complete or fail together.
	///
	/// # Errors
	///
	/// Iff any update was refused or the persistence call failed; every update is then failed.
	pub async fn process_batch(&self, captured: Vec<UpdateState>) -> Result<Vec<UpdateState>, UpdateError> {
		let batch = self.next_batch.get();
		self.next_batch.set(batch + 1);
		let shared: Vec<SharedUpdate> = captured
			.into_iter()
			.map(|mut update| {
				update.batch = Some(batch);
				self.register(update)
			})
			.collect();
		self.run_batch(&shared).await
	}

	async fn run_batch(&self, shared: &[SharedUpdate]) -> Result<Vec<UpdateState>, UpdateError> {
		for update in shared {
			self.emit(&UpdateEvent::Started(update.borrow().clone()));
		}
		let result = self.service.process_batch_update(shared).await;
		for update in shared {
			match &result {
				Err(error) => self.settle(update, Some(error)),
				Ok(()) => self.settle(update, None),
			}
		}
		result.map(|()| shared.iter().map(|update| update.borrow().clone()).collect())
	}

	/// Queues an edit for the next batch flush, folding it into a queued edit of the same node and operation.
	///
	/// # Errors
	///
	/// Iff the edit could not be captured.
	#[instrument(skip(self, new_value))]
	pub fn queue(&self, node: NodeId, operation: Operation, new_value: &str) -> Result<UpdateId, EditError> {
		let now = self.clock.now();
		let mut batch = self.batch.borrow_mut();
		let merged = batch.merge(now, |queued| {
			let mut queued = queued.borrow_mut();
			if queued.node == node && queued.operation == operation {
				queued.new_value = new_value.to_owned();
				Some(queued.id)
			} else {
				None
			}
		});
		if let Some(id) = merged {
			trace!(%id, "Folded into queued edit.");
			return Ok(id);
		}
		let update = self.edits.capture(node, operation, new_value)?;
		let id = update.id;
		batch.push(Rc::new(RefCell::new(update)), now);
		Ok(id)
	}

	/// Number of edits waiting for the batch window.
	#[must_use]
	pub fn queued(&self) -> usize {
		self.batch.borrow().len()
	}

	/// Flushes the batch window if it elapsed and processes mutations observed in the render tree.
	pub async fn tick(&self) {
		self.process_observed().await;
		let due = self.batch.borrow_mut().take_due(self.clock.now());
		if let Some(due) = due {
			self.flush_updates(due).await;
		}
	}

	/// Flushes the batch window now.
	pub async fn flush(&self) {
		let queued = self.batch.borrow_mut().flush();
		self.flush_updates(queued).await;
	}

	async fn flush_updates(&self, queued: Vec<SharedUpdate>) {
		if queued.is_empty() {
			return;
		}
		let batch = self.next_batch.get();
		self.next_batch.set(batch + 1);
		for update in &queued {
			update.borrow_mut().batch = Some(batch);
			self.updates.borrow_mut().push(update.clone());
		}
		if let Err(error) = self.run_batch(&queued).await {
			debug!(%error, "Queued batch failed.");
		}
	}

	/// Runs every observed edit through the pipeline. The render already shows them.
	pub async fn process_observed(&self) {
		let events = self.resolver.tree().take_mutations();
		if events.is_empty() {
			return;
		}
		for update in self.observer.process(events, &self.edits) {
			if let Err(error) = self.run(self.register(update)).await {
				debug!(%error, "Observed edit failed.");
			}
		}
	}

	/// Reverts the most recent completed update in render and source.
	pub async fn undo(&self) -> Option<UpdateState> {
		let update = self.history.borrow_mut().undo()?;
		let (old_value, new_value) = {
			let state = update.borrow();
			(state.old_value.clone(), state.new_value.clone())
		};
		self.service.replay(&update, &old_value, &new_value).await;
		let snapshot = update.borrow().clone();
		self.emit(&UpdateEvent::Reverted(snapshot.clone()));
		Some(snapshot)
	}

	/// Re-applies the most recently undone update in render and source.
	pub async fn redo(&self) -> Option<UpdateState> {
		let update = self.history.borrow_mut().redo()?;
		let (old_value, new_value) = {
			let state = update.borrow();
			(state.old_value.clone(), state.new_value.clone())
		};
		self.service.replay(&update, &new_value, &old_value).await;
		let snapshot = update.borrow().clone();
		self.emit(&UpdateEvent::Reapplied(snapshot.clone()));
		Some(snapshot)
	}
}
