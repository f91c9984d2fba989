//! The page-side composition root: selection state, host command handling and relaying of pipeline results.
//!
//! Inbound host commands are queued by the bridge's subscribers and handled in [`DesignMode::process_inbox`], so no
//! bridge borrow is ever held across an edit.

use crate::{
	bridge::{Bridge, BridgeRole, Subscription, Transport},
	clock::Clock,
	config::Config,
	matcher::MAX_NESTING_DEPTH,
	namespace::Namespace,
	protocol::{
		BatchItem, BatchUpdate, EditKind, ElementInfo, ElementSelected, ElementSnapshot, ElementState, Envelope, ErrorCode, ErrorPayload, Message, MessageType,
		ToggleDesignMode, UpdateContent, UpdateStyle, ValueChange,
	},
	resolver::SourceResolver,
	source::SourceLocation,
	tree::{NodeId, RenderTree},
	update::{EditError, Operation, Persistence, UpdateError, UpdateEvent, UpdateManager, UpdateState},
};
use std::{
	cell::{Cell, RefCell},
	collections::VecDeque,
	rc::{Rc, Weak},
};
use tracing::{debug, info, instrument, trace, warn};

/// Host commands this side acts on.
const COMMANDS: [MessageType; 5] = [
	MessageType::ToggleDesignMode,
	MessageType::UpdateStyle,
	MessageType::UpdateContent,
	MessageType::BatchUpdate,
	MessageType::GetElementState,
];

pub struct DesignMode {
	namespace: Rc<Namespace>,
	bridge: Rc<Bridge>,
	updates: UpdateManager,
	enabled: Cell<bool>,
	selected: Cell<Option<NodeId>>,
	inbox: Rc<RefCell<VecDeque<Envelope>>>,
	subscriptions: RefCell<Vec<Subscription>>,
	relay: Cell<Option<u64>>,
}

impl core::fmt::Debug for DesignMode {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("DesignMode")
			.field("enabled", &self.enabled.get())
			.field("selected", &self.selected.get())
			.field("bridge", &self.bridge)
			.field("inbox", &self.inbox.borrow().len())
			.finish_non_exhaustive()
	}
}

impl DesignMode {
	/// Wires a bridge and an update pipeline around `tree`. Call [`start`](`DesignMode::start`) to begin the handshake.
	#[must_use]
	pub fn new(
		role: BridgeRole,
		config: &Config,
		namespace: Rc<Namespace>,
		tree: Rc<dyn RenderTree>,
		transport: Rc<dyn Transport>,
		persistence: Rc<dyn Persistence>,
		clock: Rc<dyn Clock>,
	) -> Self {
		let bridge = Rc::new(Bridge::new(role, config, transport, Rc::clone(&clock)));
		let resolver = SourceResolver::new(Rc::clone(&namespace), tree);
		let updates = UpdateManager::new(resolver, persistence, &config.update, clock);
		updates.observer().set_enabled(false);
		let inbox: Rc<RefCell<VecDeque<Envelope>>> = Rc::default();

		let subscriptions = COMMANDS
			.iter()
			.map(|&kind| {
				let inbox = Rc::clone(&inbox);
				bridge.on(kind, move |envelope| inbox.borrow_mut().push_back(envelope.clone()))
			})
			.collect();

		let weak_bridge = Rc::downgrade(&bridge);
		let relay = updates.subscribe(move |event| relay_event(&weak_bridge, event));

		Self {
			namespace,
			bridge,
			updates,
			enabled: Cell::new(false),
			selected: Cell::new(None),
			inbox,
			subscriptions: RefCell::new(subscriptions),
			relay: Cell::new(Some(relay)),
		}
	}

	pub fn start(&self) {
		self.bridge.start();
	}

	/// Unsubscribes from the bridge and disconnects it. Queued commands are dropped.
	#[instrument(skip(self))]
	pub fn dispose(&self) {
		for subscription in self.subscriptions.borrow_mut().drain(..) {
			subscription.unsubscribe();
		}
		if let Some(relay) = self.relay.take() {
			self.updates.unsubscribe(relay);
		}
		self.inbox.borrow_mut().clear();
		self.bridge.disconnect();
	}

	#[must_use]
	pub fn bridge(&self) -> &Rc<Bridge> {
		&self.bridge
	}

	#[must_use]
	pub fn updates(&self) -> &UpdateManager {
		&self.updates
	}

	#[must_use]
	pub fn namespace(&self) -> &Namespace {
		&self.namespace
	}

	#[must_use]
	pub fn is_enabled(&self) -> bool {
		self.enabled.get()
	}

	#[must_use]
	pub fn selected(&self) -> Option<NodeId> {
		self.selected.get()
	}

	/// Turns design mode on or off. Turning it off drops the selection and stops mutation observation.
	#[instrument(skip(self))]
	pub fn set_enabled(&self, enabled: bool) {
		if self.enabled.replace(enabled) == enabled {
			return trace!("Unchanged.");
		}
		self.updates.observer().set_enabled(enabled);
		if !enabled {
			self.deselect();
		}
		info!(enabled, "Design mode toggled.");
	}

	/// What the host learns about `node`, or [`None`] if it is no longer rendered.
	#[must_use]
	pub fn element_info(&self, node: NodeId) -> Option<ElementInfo> {
		let resolver = self.updates.resolver();
		let tree = resolver.tree();
		if !tree.contains(node) {
			return None;
		}
		let source_info = resolver.resolve(node);
		let instance_count = source_info.as_ref().map_or(1, |location| self.updates.matcher().find_instances(node, location).len());
		Some(ElementInfo {
			tag_name: tree.tag_name(node).unwrap_or_default().to_ascii_lowercase(),
			class_name: tree.attribute(node, "class").unwrap_or_default(),
			text_content: tree.text_content(node).unwrap_or_default(),
			element_id: resolver.element_id(node),
			static_content: resolver.is_static_content(node),
			static_class: resolver.is_static_class(node),
			source_info,
			instance_count,
		})
	}

	/// Selects `node` and announces it to the host. Returns what was announced.
	#[instrument(skip(self))]
	pub fn select(&self, node: NodeId) -> Option<ElementInfo> {
		if !self.enabled.get() {
			debug!("Design mode is off; not selecting.");
			return None;
		}
		let element_info = self.element_info(node)?;
		if element_info.source_info.is_none() {
			debug!("Selected node has no source location.");
		}
		self.selected.set(Some(node));
		self.post(Message::ElementSelected(ElementSelected { element_info: element_info.clone() }));
		Some(element_info)
	}

	pub fn deselect(&self) {
		if self.selected.take().is_some() {
			self.post(Message::ElementDeselected);
		}
	}

	/// Hands `node` to the host's chat.
	pub fn add_to_chat(&self, node: NodeId) {
		if let Some(snapshot) = self.snapshot(node) {
			self.post(Message::AddToChat(snapshot));
		}
	}

	/// Hands `node` to the host's clipboard.
	pub fn copy_element(&self, node: NodeId) {
		if let Some(snapshot) = self.snapshot(node) {
			self.post(Message::CopyElement(snapshot));
		}
	}

	fn snapshot(&self, node: NodeId) -> Option<ElementSnapshot> {
		let element = self.element_info(node)?;
		Some(ElementSnapshot { source_info: element.source_info.clone(), element })
	}

	fn post(&self, message: impl Into<Envelope>) {
		if let Err(error) = self.bridge.send(message) {
			warn!(%error, "Could not notify the host.");
		}
	}

	fn report(&self, code: ErrorCode, message: String, source_info: Option<SourceLocation>, request_id: Option<String>) {
		let mut envelope = Message::Error(ErrorPayload { code, message, source_info }).into_envelope();
		envelope.request_id = request_id;
		self.post(envelope);
	}

	/// Feeds one frame into the bridge and handles whatever commands it carried.
	pub async fn receive(&self, frame: &str) {
		if self.bridge.receive(frame).is_ok() {
			self.process_inbox().await;
		}
	}

	/// Handles queued host commands in arrival order.
	pub async fn process_inbox(&self) {
		loop {
			let next = self.inbox.borrow_mut().pop_front();
			match next {
				Some(envelope) => self.handle(envelope).await,
				None => break,
			}
		}
	}

	/// Advances bridge timers, handles queued commands, then flushes batched and observed edits.
	pub async fn tick(&self) {
		self.bridge.tick();
		self.process_inbox().await;
		self.updates.tick().await;
	}

	/// Acts on one host command.
	#[instrument(skip(self, envelope), fields(kind = %envelope.kind, request_id = ?envelope.request_id))]
	pub async fn handle(&self, envelope: Envelope) {
		let message = match envelope.message() {
			Ok(message) => message,
			Err(error) => {
				warn!(%error, "Dropping malformed command.");
				return self.report(ErrorCode::Protocol, error.to_string(), None, envelope.request_id);
			}
		};
		let request_id = envelope.request_id;
		match message {
			Message::ToggleDesignMode(ToggleDesignMode { enabled }) => self.set_enabled(enabled),
			Message::GetElementState => self.answer_state(request_id),
			_ if !self.enabled.get() => debug!("Design mode is off; ignoring command."),
			Message::UpdateStyle(UpdateStyle { source_info, new_class }) => self.apply_command(&source_info, Operation::ClassUpdate, &new_class, request_id).await,
			Message::UpdateContent(UpdateContent { source_info, new_content }) => {
				self.apply_command(&source_info, Operation::ContentUpdate, &new_content, request_id).await;
			}
			Message::BatchUpdate(batch) => self.apply_batch(batch).await,
			other => trace!(kind = %other.kind(), "Not a command."),
		}
	}

	fn answer_state(&self, request_id: Option<String>) {
		let state = ElementState {
			design_mode_enabled: self.enabled.get(),
			selected: self.selected.get().and_then(|node| self.element_info(node)),
		};
		let mut envelope = Message::ElementStateResponse(state).into_envelope();
		envelope.request_id = request_id;
		self.post(envelope);
	}

	/// Applies a single-node command, but only if it still refers to exactly what is selected here.
	async fn apply_command(&self, source_info: &SourceLocation, operation: Operation, value: &str, request_id: Option<String>) {
		let node = match self.selected.get() {
			Some(node) => node,
			None => {
				warn!("Command arrived with nothing selected; discarding.");
				return self.report(ErrorCode::NotSelected, "no element is selected".to_owned(), Some(source_info.clone()), request_id);
			}
		};
		let location = match self.updates.resolver().resolve(node) {
			Some(location) if &location == source_info => location,
			current => {
				warn!(commanded = %source_info, current = ?current.map(|location| location.to_string()), "Command refers to a stale selection; discarding.");
				return self.report(ErrorCode::StaleCommand, "command does not match the selected element".to_owned(), Some(source_info.clone()), request_id);
			}
		};

		if operation == Operation::ContentUpdate {
			self.confirm_static(node, &location).await;
		}
		match self.updates.update_everywhere(node, operation, value).await {
			Ok(updates) => debug!(count = updates.len(), "Command applied."),
			Err(UpdateError::Edit(EditError::Unchanged)) => debug!("Command would not change anything."),
			Err(error @ UpdateError::Edit(_)) => {
				warn!(%error, "Command refused.");
				self.report(error.code(), error.to_string(), Some(location), request_id);
			}
			// Reported through the pipeline's failure events.
			Err(error) => debug!(%error, "Command failed."),
		}
	}

	/// Asks the persistence collaborator whether unmarked content is a literal, remembering a confirmation.
	async fn confirm_static(&self, node: NodeId, location: &SourceLocation) {
		let resolver = self.updates.resolver();
		if resolver.has_static_content_marker(node) || self.updates.edits().is_content_editable(node, location) {
			return;
		}
		let check = self.updates.service().persistence().check_static(location);
		match check.await {
			Ok(true) => {
				debug!(%location, "Content confirmed static.");
				self.updates.edits().confirm_static(location.clone());
			}
			Ok(false) => debug!(%location, "Content is computed."),
			Err(error) => warn!(%location, %error, "Could not check whether content is static."),
		}
	}

	/// Applies host-issued edits by location, persisting them all with one call.
	#[instrument(skip(self, batch), fields(items = batch.updates.len()))]
	async fn apply_batch(&self, batch: BatchUpdate) {
		let mut captured = Vec::new();
		for item in batch.updates {
			let operation = match item.kind {
				EditKind::Style => Operation::ClassUpdate,
				EditKind::Content => Operation::ContentUpdate,
			};
			let nodes = self.nodes_at(&item.source_info, &operation);
			if nodes.is_empty() {
				warn!(location = %item.source_info, "No rendered node at batch location.");
				continue;
			}
			for node in nodes {
				if operation == Operation::ContentUpdate {
					if let Some(location) = self.updates.resolver().resolve(node) {
						self.confirm_static(node, &location).await;
					}
				}
				match self.capture_item(node, operation.clone(), &item) {
					Ok(update) => captured.push(update),
					Err(error) => debug!(?node, %error, "Skipping batch item."),
				}
			}
		}
		if captured.is_empty() {
			return debug!("Nothing to apply.");
		}
		match self.updates.process_batch(captured).await {
			Ok(updates) => debug!(count = updates.len(), "Batch applied."),
			Err(error) => debug!(%error, "Batch failed."),
		}
	}

	fn capture_item(&self, node: NodeId, operation: Operation, item: &BatchItem) -> Result<UpdateState, EditError> {
		let mut update = self.updates.edits().capture(node, operation, &item.new_value)?;
		if let Some(original) = &item.original_value {
			if original != &update.old_value {
				debug!(id = %update.id, "Host's original value differs from the render; persisting against the host's.");
			}
			update.old_value = original.clone();
		}
		Ok(update)
	}

	/// Rendered nodes an edit of `location` lands on, with every instance of them.
	///
	/// Candidates are found by their *resolved* location, so content passed in from a usage site is found on the node
	/// showing it. A candidate enclosing another candidate is that usage site's container and is never a target: writing
	/// content to it would replace the component rendered inside.
	fn nodes_at(&self, location: &SourceLocation, operation: &Operation) -> Vec<NodeId> {
		let resolver = self.updates.resolver();
		let tree = resolver.tree();
		let mut candidates: Vec<NodeId> = Vec::new();
		for name in [self.namespace.source(), self.namespace.file(), self.namespace.children_source()] {
			for node in tree.nodes_having_attribute(name) {
				if !candidates.contains(&node) && resolver.resolve(node).map_or(false, |resolved| resolved.matches(location)) {
					candidates.push(node);
				}
			}
		}

		let matcher = self.updates.matcher();
		let mut nodes = Vec::new();
		for &target in &candidates {
			if candidates.iter().any(|&other| other != target && encloses(tree, target, other)) {
				trace!(?target, "Skipping container of passed-in content.");
				continue;
			}
			let instances = if *operation == Operation::ContentUpdate {
				matcher.find_content_instances(target, location)
			} else {
				matcher.find_instances(target, location)
			};
			for instance in instances {
				if !nodes.contains(&instance) {
					nodes.push(instance);
				}
			}
		}
		nodes
	}
}

impl Drop for DesignMode {
	fn drop(&mut self) {
		if !self.subscriptions.get_mut().is_empty() {
			self.dispose();
		}
	}
}

/// Tells the host about pipeline results.
/// Whether `ancestor` is above `node`.
fn encloses(tree: &dyn RenderTree, ancestor: NodeId, node: NodeId) -> bool {
	let mut current = node;
	for _ in 0..MAX_NESTING_DEPTH {
		current = match tree.parent(current) {
			Some(parent) => parent,
			None => return false,
		};
		if current == ancestor {
			return true;
		}
	}
	false
}

fn relay_event(bridge: &Weak<Bridge>, event: &UpdateEvent) {
	let bridge = match bridge.upgrade() {
		Some(bridge) => bridge,
		None => return,
	};
	let message = match event {
		UpdateEvent::Started(_) => return,
		UpdateEvent::Completed(update) | UpdateEvent::Reapplied(update) => value_change(update, &update.old_value, &update.new_value),
		UpdateEvent::Reverted(update) => value_change(update, &update.new_value, &update.old_value),
		UpdateEvent::Failed { update, code } => Message::Error(ErrorPayload {
			code: *code,
			message: update.error.clone().unwrap_or_else(|| format!("{} failed", update.id)),
			source_info: Some(update.location.clone()),
		}),
	};
	if cfg!(feature = "dangerous-logging") {
		trace!(?message, "Relaying.");
	}
	if let Err(error) = bridge.send(message) {
		warn!(%error, "Could not relay update result.");
	}
}

fn value_change(update: &UpdateState, old_value: &str, new_value: &str) -> Message {
	let change = ValueChange {
		source_info: update.location.clone(),
		old_value: old_value.to_owned(),
		new_value: new_value.to_owned(),
	};
	match update.operation.edit_kind() {
		EditKind::Content => Message::ContentUpdated(change),
		EditKind::Style => Message::StyleUpdated(change),
	}
}
