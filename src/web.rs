//! The browser backend: the DOM as a [`RenderTree`], `postMessage` as a [`Transport`], and the event wiring that drives
//! a [`DesignMode`] from `message` events and an interval.

use crate::{
	bridge::{BridgeRole, Transport, TransportError},
	clock::SystemClock,
	config::Config,
	design_mode::DesignMode,
	namespace::{Namespace, NamespaceCache, PrefixSource, PREFIX_META_NAME},
	protocol::Envelope,
	tree::{MutationEvent, MutationKind, NodeId, RenderTree, TreeError},
	update::Persistence,
};
use hashbrown::HashMap;
use js_sys::{Array, Reflect, JSON};
use std::{
	cell::{Cell, RefCell},
	rc::Rc,
};
use tracing::{debug, instrument, trace, warn};
use wasm_bindgen::{closure::Closure, JsCast, JsValue};
use web_sys::{Document, Element, HtmlMetaElement, MessageEvent, MutationObserver, MutationObserverInit, MutationRecord, Node, Window};

/// Name of the page's global configuration object.
pub const CONFIG_GLOBAL: &str = "__DESIGN_MODE_CONFIG__";

/// Property under which [`WebTree`] remembers an element's [`NodeId`].
const HANDLE_PROPERTY: &str = "__designModeNode";

/// Handle count below which [`WebTree`] does not bother pruning.
const MIN_PRUNE_AT: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum WebError {
	#[error("there is no global `window`")]
	NoWindow,
	#[error("the window has no document (element)")]
	NoDocument,
	#[error("JavaScript error: {0}")]
	Js(String),
}

impl From<JsValue> for WebError {
	fn from(value: JsValue) -> Self {
		WebError::Js(format!("{:?}", value))
	}
}

/// Reads the page's global configuration object, falling back to defaults if it is missing or malformed.
#[must_use]
pub fn load_config(window: &Window) -> Config {
	let global = match Reflect::get(window, &JsValue::from_str(CONFIG_GLOBAL)) {
		Ok(global) if global.is_object() => global,
		_ => return Config::default(),
	};
	let json = match JSON::stringify(&global).ok().and_then(|json| json.as_string()) {
		Some(json) => json,
		None => return Config::default(),
	};
	Config::from_json(&json).unwrap_or_else(|error| {
		warn!(%error, "Malformed page configuration; using defaults.");
		Config::default()
	})
}

/// Looks for the marker prefix in the page's global configuration and an injected `<meta>` tag.
#[derive(Debug, Clone)]
pub struct WindowPrefixSource {
	window: Window,
}

impl WindowPrefixSource {
	#[must_use]
	pub fn new(window: Window) -> Self {
		Self { window }
	}
}

impl PrefixSource for WindowPrefixSource {
	fn configured_prefix(&self) -> Option<String> {
		let global = Reflect::get(&self.window, &JsValue::from_str(CONFIG_GLOBAL)).ok().filter(JsValue::is_object)?;
		Reflect::get(&global, &JsValue::from_str("attributePrefix")).ok()?.as_string()
	}

	fn injected_prefix(&self) -> Option<String> {
		let document = self.window.document()?;
		let meta = document.query_selector(&format!("meta[name=\"{}\"]", PREFIX_META_NAME)).ok()??;
		Some(meta.dyn_into::<HtmlMetaElement>().ok()?.content()).filter(|content| !content.is_empty())
	}
}

/// The live DOM below one root element.
///
/// Elements are handed out as [`NodeId`]s on first sight and keep theirs while they stay in the document. Handles of
/// elements that left the document are pruned once the table has doubled, so detached DOM is not kept alive. Mutations
/// are collected by a `MutationObserver` watching `class`, `style`, the ignore-mutation marker and text below the root.
pub struct WebTree {
	document: Document,
	nodes: RefCell<HashMap<u32, Element>>,
	next_id: Cell<u32>,
	prune_at: Cell<usize>,
	observer: MutationObserver,
	records: Rc<RefCell<Vec<MutationRecord>>>,
	_on_mutation: Closure<dyn FnMut(Array, MutationObserver)>,
}

impl core::fmt::Debug for WebTree {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("WebTree").field("nodes", &self.nodes.borrow().len()).field("records", &self.records.borrow().len()).finish_non_exhaustive()
	}
}

impl WebTree {
	/// Starts observing `document`'s root element, with markers named by `namespace`.
	///
	/// # Errors
	///
	/// Iff the document has no root element or the observer could not be set up.
	#[instrument(skip(document, namespace), fields(prefix = namespace.prefix()))]
	pub fn new(document: Document, namespace: &Namespace) -> Result<Self, WebError> {
		let root = document.document_element().ok_or(WebError::NoDocument)?;
		let records: Rc<RefCell<Vec<MutationRecord>>> = Rc::default();
		let on_mutation = {
			let records = Rc::clone(&records);
			Closure::wrap(Box::new(move |batch: Array, _: MutationObserver| {
				records.borrow_mut().extend(batch.iter().filter_map(|record| record.dyn_into::<MutationRecord>().ok()));
			}) as Box<dyn FnMut(Array, MutationObserver)>)
		};
		let observer = MutationObserver::new(on_mutation.as_ref().unchecked_ref())?;

		let init = MutationObserverInit::new();
		init.set_subtree(true);
		init.set_attributes(true);
		init.set_attribute_old_value(true);
		init.set_attribute_filter(&Array::of3(&JsValue::from_str("class"), &JsValue::from_str("style"), &JsValue::from_str(namespace.ignore_mutation())));
		init.set_character_data(true);
		init.set_character_data_old_value(true);
		init.set_child_list(true);
		observer.observe_with_options(&root, &init)?;
		debug!("Observing mutations.");

		Ok(Self {
			document,
			nodes: RefCell::default(),
			next_id: Cell::new(0),
			prune_at: Cell::new(MIN_PRUNE_AT),
			observer,
			records,
			_on_mutation: on_mutation,
		})
	}

	/// The [`NodeId`] of `element`, assigning one if it has none yet.
	#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
	pub fn node_id(&self, element: &Element) -> NodeId {
		let key = JsValue::from_str(HANDLE_PROPERTY);
		if let Some(id) = Reflect::get(element, &key).ok().and_then(|id| id.as_f64()) {
			let id = NodeId(id as u32);
			if self.element(id).as_ref() == Some(element) {
				return id;
			}
		}
		if self.nodes.borrow().len() >= self.prune_at.get() {
			self.prune();
			self.prune_at.set((self.nodes.borrow().len() * 2).max(MIN_PRUNE_AT));
		}
		let id = NodeId(self.next_id.get());
		self.next_id.set(id.0.wrapping_add(1));
		self.nodes.borrow_mut().insert(id.0, element.clone());
		if Reflect::set(element, &key, &JsValue::from(id.0)).is_err() {
			trace!(?id, "Could not tag element with its handle.");
		}
		id
	}

	/// The element behind `node`, unless its handle was pruned.
	#[must_use]
	pub fn element(&self, node: NodeId) -> Option<Element> {
		self.nodes.borrow().get(&node.0).cloned()
	}

	/// Forgets every element that is no longer in the document. Their handles go stale; should such an element come
	/// back, it gets a new one.
	///
	/// Returns how many handles were dropped.
	pub fn prune(&self) -> usize {
		let mut nodes = self.nodes.borrow_mut();
		let before = nodes.len();
		nodes.retain(|_, element| element.is_connected());
		let pruned = before - nodes.len();
		if pruned > 0 {
			debug!(pruned, kept = nodes.len(), "Pruned detached element handles.");
		}
		pruned
	}

	fn query(&self, selector: &str) -> Vec<NodeId> {
		let list = match self.document.query_selector_all(selector) {
			Ok(list) => list,
			Err(error) => {
				warn!(?error, %selector, "Attribute lookup failed.");
				return Vec::new();
			}
		};
		(0..list.length())
			.filter_map(|i| list.item(i)?.dyn_into::<Element>().ok())
			.map(|element| self.node_id(&element))
			.collect()
	}

	fn connected(&self, node: NodeId) -> Result<Element, TreeError> {
		self.element(node).filter(|element| element.is_connected()).ok_or(TreeError::Detached(node))
	}

	fn convert(&self, record: &MutationRecord) -> Option<MutationEvent> {
		let target = record.target()?;
		let (element, kind) = match record.type_().as_str() {
			"attributes" => (target.dyn_into::<Element>().ok()?, MutationKind::Attribute { name: record.attribute_name()?, old_value: record.old_value() }),
			// Reported on the text node; the edit belongs to its element.
			"characterData" => (target.parent_element()?, MutationKind::Text { old_value: record.old_value() }),
			// Children replaced wholesale, as the pipeline's own content writes do.
			"childList" => (target.dyn_into::<Element>().ok()?, MutationKind::Text { old_value: None }),
			other => {
				trace!(kind = other, "Unexpected mutation record.");
				return None;
			}
		};
		Some(MutationEvent { target: self.node_id(&element), kind })
	}
}

impl Drop for WebTree {
	fn drop(&mut self) {
		self.observer.disconnect();
	}
}

fn rejected(error: JsValue) -> TreeError {
	TreeError::Rejected(format!("{:?}", error))
}

impl RenderTree for WebTree {
	fn contains(&self, node: NodeId) -> bool {
		self.connected(node).is_ok()
	}

	fn parent(&self, node: NodeId) -> Option<NodeId> {
		let parent = self.element(node)?.parent_element()?;
		Some(self.node_id(&parent))
	}

	fn tag_name(&self, node: NodeId) -> Option<String> {
		Some(self.element(node)?.tag_name())
	}

	fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
		self.element(node)?.get_attribute(name)
	}

	fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), TreeError> {
		self.connected(node)?.set_attribute(name, value).map_err(rejected)
	}

	fn remove_attribute(&self, node: NodeId, name: &str) -> Result<(), TreeError> {
		self.connected(node)?.remove_attribute(name).map_err(rejected)
	}

	fn text_content(&self, node: NodeId) -> Option<String> {
		let element = self.element(node)?;
		let node: &Node = element.as_ref();
		node.text_content()
	}

	fn set_text_content(&self, node: NodeId, text: &str) -> Result<(), TreeError> {
		let element = self.connected(node)?;
		let node: &Node = element.as_ref();
		node.set_text_content(Some(text));
		Ok(())
	}

	fn nodes_with_attribute(&self, name: &str, value: &str) -> Vec<NodeId> {
		self.query(&format!("[{}=\"{}\"]", name, value.replace('\\', "\\\\").replace('"', "\\\"")))
	}

	fn nodes_having_attribute(&self, name: &str) -> Vec<NodeId> {
		self.query(&format!("[{}]", name))
	}

	fn take_mutations(&self) -> Vec<MutationEvent> {
		let mut records = core::mem::take(&mut *self.records.borrow_mut());
		records.extend(self.observer.take_records().iter().filter_map(|record| record.dyn_into::<MutationRecord>().ok()));
		records.iter().filter_map(|record| self.convert(record)).collect()
	}
}

/// Frames to and from another window via `postMessage`.
#[derive(Debug, Clone)]
pub struct PostMessageTransport {
	target: Option<Window>,
	target_origin: String,
}

impl PostMessageTransport {
	/// Talks to `target` (the parent window when embedded, a frame's window when hosting).
	#[must_use]
	pub fn new(target: Option<Window>, target_origin: impl Into<String>) -> Self {
		Self { target, target_origin: target_origin.into() }
	}

	/// Talks to `window`'s parent, if `window` is embedded at all.
	#[must_use]
	pub fn to_parent(window: &Window, target_origin: impl Into<String>) -> Self {
		let parent = window.parent().ok().flatten().filter(|parent| parent != window);
		Self::new(parent, target_origin)
	}

	/// Whether a `message` event from `origin` is meant for this transport.
	#[must_use]
	pub fn accepts_origin(&self, origin: &str) -> bool {
		self.target_origin == "*" || self.target_origin == origin
	}
}

impl Transport for PostMessageTransport {
	fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
		let target = self.target.as_ref().ok_or_else(|| TransportError("no target window".to_owned()))?;
		let json = envelope.to_json().map_err(|error| TransportError(error.to_string()))?;
		let message = JSON::parse(&json).map_err(|error| TransportError(format!("{:?}", error)))?;
		target.post_message(&message, &self.target_origin).map_err(|error| TransportError(format!("{:?}", error)))
	}

	fn has_counterpart(&self) -> bool {
		self.target.as_ref().map_or(false, |target| !target.closed().unwrap_or(true))
	}
}

/// Keeps a [`DesignMode`] wired to its window. Dropping it unhooks everything and disposes the design mode.
pub struct WebRuntime {
	window: Window,
	design_mode: Rc<DesignMode>,
	on_message: Closure<dyn FnMut(MessageEvent)>,
	_on_tick: Closure<dyn FnMut()>,
	interval: i32,
}

impl core::fmt::Debug for WebRuntime {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("WebRuntime").field("design_mode", &self.design_mode).field("interval", &self.interval).finish_non_exhaustive()
	}
}

impl WebRuntime {
	/// Starts `design_mode`, feeding it `message` events that `accepts` and ticking it every `tick_millis`.
	///
	/// # Errors
	///
	/// Iff the listener or the interval could not be registered.
	#[instrument(skip(window, design_mode, accepts))]
	pub fn install(window: Window, design_mode: Rc<DesignMode>, accepts: impl Fn(&MessageEvent) -> bool + 'static, tick_millis: i32) -> Result<Self, WebError> {
		let on_message = {
			let design_mode = Rc::clone(&design_mode);
			Closure::wrap(Box::new(move |event: MessageEvent| {
				if !accepts(&event) {
					return trace!(origin = %event.origin(), "Ignoring message from unexpected origin.");
				}
				let frame = match JSON::stringify(&event.data()).ok().and_then(|frame| frame.as_string()) {
					Some(frame) => frame,
					None => return trace!("Ignoring message that is not JSON."),
				};
				let design_mode = Rc::clone(&design_mode);
				wasm_bindgen_futures::spawn_local(async move { design_mode.receive(&frame).await });
			}) as Box<dyn FnMut(MessageEvent)>)
		};
		window.add_event_listener_with_callback("message", on_message.as_ref().unchecked_ref())?;

		let on_tick = {
			let design_mode = Rc::clone(&design_mode);
			Closure::wrap(Box::new(move || {
				let design_mode = Rc::clone(&design_mode);
				wasm_bindgen_futures::spawn_local(async move { design_mode.tick().await });
			}) as Box<dyn FnMut()>)
		};
		let interval = window.set_interval_with_callback_and_timeout_and_arguments_0(on_tick.as_ref().unchecked_ref(), tick_millis)?;

		design_mode.start();
		debug!("Design mode installed.");
		Ok(Self { window, design_mode, on_message, _on_tick: on_tick, interval })
	}

	/// Wires up the current page: configuration from the global window, the marker prefix through `namespaces`, the
	/// document as render tree and, if the page is framed, its parent as host.
	///
	/// # Errors
	///
	/// Iff there is no window or document, or the event wiring failed.
	pub fn for_page(namespaces: &mut NamespaceCache, persistence: Rc<dyn Persistence>, host_origin: &str, tick_millis: i32) -> Result<Self, WebError> {
		let window = web_sys::window().ok_or(WebError::NoWindow)?;
		let document = window.document().ok_or(WebError::NoDocument)?;
		let config = load_config(&window);
		let transport = Rc::new(PostMessageTransport::to_parent(&window, host_origin));
		let role = if transport.target.is_some() { BridgeRole::Embedded } else { BridgeRole::TopLevel };
		debug!(?role, "Wiring design mode into the page.");

		let namespace = namespaces.get_or_resolve(&WindowPrefixSource::new(window.clone()));
		let tree = Rc::new(WebTree::new(document, &namespace)?);
		let design_mode = Rc::new(DesignMode::new(
			role,
			&config,
			namespace,
			tree,
			transport.clone(),
			persistence,
			Rc::new(SystemClock),
		));
		Self::install(window, design_mode, move |event| transport.accepts_origin(&event.origin()), tick_millis)
	}

	#[must_use]
	pub fn design_mode(&self) -> &Rc<DesignMode> {
		&self.design_mode
	}
}

impl Drop for WebRuntime {
	fn drop(&mut self) {
		self.window.clear_interval_with_handle(self.interval);
		if let Err(error) = self.window.remove_event_listener_with_callback("message", self.on_message.as_ref().unchecked_ref()) {
			warn!(?error, "Could not remove message listener.");
		}
		self.design_mode.dispose();
	}
}
