//! Non-owning access to the host's render tree.
//!
//! The core never creates or frees rendered nodes. It addresses them through [`NodeId`] handles that the
//! [`RenderTree`] implementation maps back to live nodes, and it may find a handle stale at any time.

use std::cell::{Cell, RefCell};
use tracing::trace;

/// An opaque handle to a rendered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
	#[error("node {0:?} is no longer part of the render tree")]
	Detached(NodeId),
	#[error("the render tree rejected the write: {0}")]
	Rejected(String),
}

/// A change to the render tree, reported after the fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
	pub target: NodeId,
	pub kind: MutationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
	Text { old_value: Option<String> },
	Attribute { name: String, old_value: Option<String> },
}

/// The operations the core needs from a render tree.
///
/// All methods take `&self`: the tree is shared between the update pipeline, the mutation observer and the host page.
pub trait RenderTree {
	fn contains(&self, node: NodeId) -> bool;
	fn parent(&self, node: NodeId) -> Option<NodeId>;
	fn tag_name(&self, node: NodeId) -> Option<String>;
	fn attribute(&self, node: NodeId, name: &str) -> Option<String>;
	/// # Errors
	///
	/// Iff the node is gone or the backend refuses the write.
	fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), TreeError>;
	/// # Errors
	///
	/// Iff the node is gone or the backend refuses the write.
	fn remove_attribute(&self, node: NodeId, name: &str) -> Result<(), TreeError>;
	fn text_content(&self, node: NodeId) -> Option<String>;
	/// # Errors
	///
	/// Iff the node is gone or the backend refuses the write.
	fn set_text_content(&self, node: NodeId, text: &str) -> Result<(), TreeError>;
	/// Every node whose attribute `name` equals `value`, in document order.
	fn nodes_with_attribute(&self, name: &str, value: &str) -> Vec<NodeId>;
	/// Every node carrying attribute `name` with any value, in document order.
	fn nodes_having_attribute(&self, name: &str) -> Vec<NodeId>;
	/// Drains the mutations recorded since the last call.
	fn take_mutations(&self) -> Vec<MutationEvent>;

	fn has_attribute(&self, node: NodeId, name: &str) -> bool {
		self.attribute(node, name).is_some()
	}
}

#[derive(Debug, Default)]
struct NodeData {
	parent: Option<NodeId>,
	children: Vec<NodeId>,
	tag: String,
	attributes: Vec<(String, String)>,
	text: String,
}

#[derive(Debug, Default)]
struct MemoryTreeInner {
	nodes: Vec<Option<NodeData>>,
	mutations: Vec<MutationEvent>,
}

/// A plain in-memory render tree, for hosts without a DOM and for tests.
#[derive(Debug)]
pub struct MemoryTree {
	inner: RefCell<MemoryTreeInner>,
	observing: Cell<bool>,
}

impl Default for MemoryTree {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryTree {
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: RefCell::new(MemoryTreeInner::default()),
			observing: Cell::new(true),
		}
	}

	/// Turns mutation recording on or off. Recording starts enabled.
	pub fn set_observing(&self, observing: bool) {
		self.observing.set(observing);
	}

	/// Creates an element and appends it to `parent`, or makes it a new root.
	///
	/// Building the tree is not recorded as mutation.
	#[allow(clippy::cast_possible_truncation)]
	pub fn create_element(&self, tag: &str, parent: Option<NodeId>, attributes: &[(&str, &str)]) -> NodeId {
		let mut inner = self.inner.borrow_mut();
		let id = NodeId(inner.nodes.len() as u32);
		let parent = parent.filter(|p| inner_contains(&inner, *p));
		inner.nodes.push(Some(NodeData {
			parent,
			children: Vec::new(),
			tag: tag.to_owned(),
			attributes: attributes.iter().map(|&(n, v)| (n.to_owned(), v.to_owned())).collect(),
			text: String::new(),
		}));
		if let Some(parent) = parent {
			if let Some(Some(parent)) = inner.nodes.get_mut(parent.0 as usize) {
				parent.children.push(id);
			}
		}
		id
	}

	/// Like [`create_element`](`MemoryTree::create_element`), with initial own text.
	pub fn create_text_element(&self, tag: &str, parent: Option<NodeId>, attributes: &[(&str, &str)], text: &str) -> NodeId {
		let id = self.create_element(tag, parent, attributes);
		if let Some(Some(node)) = self.inner.borrow_mut().nodes.get_mut(id.0 as usize) {
			node.text = text.to_owned();
		}
		id
	}

	/// Drops `node` and its subtree. Handles to them become stale.
	pub fn remove(&self, node: NodeId) {
		let mut inner = self.inner.borrow_mut();
		let parent = match inner.nodes.get(node.0 as usize) {
			Some(Some(data)) => data.parent,
			_ => return,
		};
		if let Some(Some(parent)) = parent.and_then(|p| inner.nodes.get_mut(p.0 as usize)) {
			parent.children.retain(|&c| c != node);
		}
		let mut stack = vec![node];
		while let Some(id) = stack.pop() {
			if let Some(slot) = inner.nodes.get_mut(id.0 as usize) {
				if let Some(data) = slot.take() {
					stack.extend(data.children);
				}
			}
		}
		trace!(?node, "Removed subtree.");
	}

	/// Nodes satisfying `predicate`, in document order.
	#[allow(clippy::cast_possible_truncation)]
	fn find(&self, predicate: impl Fn(&NodeData) -> bool) -> Vec<NodeId> {
		let inner = self.inner.borrow();
		let mut found = Vec::new();
		let mut stack: Vec<NodeId> = inner
			.nodes
			.iter()
			.enumerate()
			.filter_map(|(i, slot)| match slot {
				Some(data) if data.parent.is_none() => Some(NodeId(i as u32)),
				_ => None,
			})
			.rev()
			.collect();
		while let Some(id) = stack.pop() {
			if let Some(Some(data)) = inner.nodes.get(id.0 as usize) {
				if predicate(data) {
					found.push(id);
				}
				stack.extend(data.children.iter().rev().copied());
			}
		}
		found
	}

	fn record(&self, inner: &mut MemoryTreeInner, event: MutationEvent) {
		if self.observing.get() {
			inner.mutations.push(event);
		}
	}
}

fn inner_contains(inner: &MemoryTreeInner, node: NodeId) -> bool {
	matches!(inner.nodes.get(node.0 as usize), Some(Some(_)))
}

fn collect_text(inner: &MemoryTreeInner, node: NodeId, out: &mut String) {
	if let Some(Some(data)) = inner.nodes.get(node.0 as usize) {
		out.push_str(&data.text);
		for &child in &data.children {
			collect_text(inner, child, out);
		}
	}
}

impl RenderTree for MemoryTree {
	fn contains(&self, node: NodeId) -> bool {
		inner_contains(&self.inner.borrow(), node)
	}

	fn parent(&self, node: NodeId) -> Option<NodeId> {
		match self.inner.borrow().nodes.get(node.0 as usize) {
			Some(Some(data)) => data.parent,
			_ => None,
		}
	}

	fn tag_name(&self, node: NodeId) -> Option<String> {
		match self.inner.borrow().nodes.get(node.0 as usize) {
			Some(Some(data)) => Some(data.tag.clone()),
			_ => None,
		}
	}

	fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
		match self.inner.borrow().nodes.get(node.0 as usize) {
			Some(Some(data)) => data.attributes.iter().find(|(n, _)| n == name).map(|(_, v)| v.clone()),
			_ => None,
		}
	}

	fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), TreeError> {
		let mut inner = self.inner.borrow_mut();
		let data = match inner.nodes.get_mut(node.0 as usize) {
			Some(Some(data)) => data,
			_ => return Err(TreeError::Detached(node)),
		};
		let old_value = match data.attributes.iter_mut().find(|(n, _)| n == name) {
			Some((_, v)) => Some(std::mem::replace(v, value.to_owned())),
			None => {
				data.attributes.push((name.to_owned(), value.to_owned()));
				None
			}
		};
		self.record(&mut inner, MutationEvent { target: node, kind: MutationKind::Attribute { name: name.to_owned(), old_value } });
		Ok(())
	}

	fn remove_attribute(&self, node: NodeId, name: &str) -> Result<(), TreeError> {
		let mut inner = self.inner.borrow_mut();
		let data = match inner.nodes.get_mut(node.0 as usize) {
			Some(Some(data)) => data,
			_ => return Err(TreeError::Detached(node)),
		};
		if let Some(index) = data.attributes.iter().position(|(n, _)| n == name) {
			let (_, old_value) = data.attributes.remove(index);
			self.record(&mut inner, MutationEvent { target: node, kind: MutationKind::Attribute { name: name.to_owned(), old_value: Some(old_value) } });
		}
		Ok(())
	}

	fn text_content(&self, node: NodeId) -> Option<String> {
		let inner = self.inner.borrow();
		if !inner_contains(&inner, node) {
			return None;
		}
		let mut text = String::new();
		collect_text(&inner, node, &mut text);
		Some(text)
	}

	/// Replaces the node's children with the text, as the DOM does.
	fn set_text_content(&self, node: NodeId, text: &str) -> Result<(), TreeError> {
		let old_value = self.text_content(node).ok_or(TreeError::Detached(node))?;
		let children = match self.inner.borrow().nodes.get(node.0 as usize) {
			Some(Some(data)) => data.children.clone(),
			_ => return Err(TreeError::Detached(node)),
		};
		for child in children {
			self.remove(child);
		}
		let mut inner = self.inner.borrow_mut();
		if let Some(Some(data)) = inner.nodes.get_mut(node.0 as usize) {
			data.text = text.to_owned();
		}
		self.record(&mut inner, MutationEvent { target: node, kind: MutationKind::Text { old_value: Some(old_value) } });
		Ok(())
	}

	fn nodes_with_attribute(&self, name: &str, value: &str) -> Vec<NodeId> {
		self.find(|data| data.attributes.iter().any(|(n, v)| n == name && v == value))
	}

	fn nodes_having_attribute(&self, name: &str) -> Vec<NodeId> {
		self.find(|data| data.attributes.iter().any(|(n, _)| n == name))
	}

	fn take_mutations(&self) -> Vec<MutationEvent> {
		std::mem::take(&mut self.inner.borrow_mut().mutations)
	}
}
