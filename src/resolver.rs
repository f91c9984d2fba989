//! Maps rendered nodes to the source position an edit should target.

use crate::{
	namespace::Namespace,
	source::{parse_children_source, FileType, SourceLocation},
	tree::{NodeId, RenderTree},
};
use std::rc::Rc;
use tracing::{instrument, trace, trace_span, warn};

/// How far any ancestor walk may climb before giving up.
pub const MAX_ANCESTOR_DEPTH: usize = 32;

#[derive(Clone)]
pub struct SourceResolver {
	namespace: Rc<Namespace>,
	tree: Rc<dyn RenderTree>,
}

impl core::fmt::Debug for SourceResolver {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("SourceResolver").field("prefix", &self.namespace.prefix()).finish_non_exhaustive()
	}
}

impl SourceResolver {
	#[must_use]
	pub fn new(namespace: Rc<Namespace>, tree: Rc<dyn RenderTree>) -> Self {
		Self { namespace, tree }
	}

	#[must_use]
	pub fn namespace(&self) -> &Namespace {
		&self.namespace
	}

	#[must_use]
	pub fn namespace_rc(&self) -> Rc<Namespace> {
		Rc::clone(&self.namespace)
	}

	#[must_use]
	pub fn tree(&self) -> &dyn RenderTree {
		&*self.tree
	}

	#[must_use]
	pub fn tree_rc(&self) -> Rc<dyn RenderTree> {
		Rc::clone(&self.tree)
	}

	/// The source location an edit of `node` should be written to.
	///
	/// Content passed in from a usage site resolves to that site. Returns [`None`] rather than guessing.
	#[instrument(skip(self))]
	pub fn resolve(&self, node: NodeId) -> Option<SourceLocation> {
		if let Some(encoded) = self.tree.attribute(node, self.namespace.children_source()) {
			if let Some(location) = parse_children_source(&encoded) {
				trace!(%location, "Redirected by explicit children source.");
				return Some(location);
			}
			if let Some(usage) = self.nearest_usage_ancestor(node) {
				if let Some(location) = self.own_location(usage) {
					trace!(%location, ?usage, "Redirected to usage site.");
					return Some(location);
				}
			}
			warn!(?node, "Node receives passed-in content but no usage site was found; using its own markers.");
		}
		self.own_location(node)
	}

	/// Resolution for pass-through (slot) content.
	///
	/// Prefers the explicit children-source reference. Otherwise climbs while ancestors carry static content in the same
	/// file, returning the first ancestor from a different file (the site that supplied the content), else the node's
	/// own location.
	#[instrument(skip(self))]
	pub fn resolve_children_source(&self, node: NodeId) -> Option<SourceLocation> {
		if let Some(location) = self.tree.attribute(node, self.namespace.children_source()).as_deref().and_then(parse_children_source) {
			return Some(location);
		}
		let own = self.own_location(node)?;
		let span = trace_span!("Walking pass-through ancestors", file = %own.file_name);
		let _enter = span.enter();

		let mut current = node;
		for _ in 0..MAX_ANCESTOR_DEPTH {
			current = match self.tree.parent(current) {
				Some(parent) => parent,
				None => break,
			};
			if !self.is_static_content(current) {
				trace!(?current, "Stopped at computed content.");
				break;
			}
			match self.own_location(current) {
				Some(location) if location.file_name != own.file_name => return Some(location),
				_ => (),
			}
		}
		Some(own)
	}

	/// The node's own markers: the structured blob if well-formed, else the discrete file/line/column markers.
	#[must_use]
	pub fn own_location(&self, node: NodeId) -> Option<SourceLocation> {
		if let Some(structured) = self.tree.attribute(node, self.namespace.source()) {
			match serde_json::from_str::<SourceLocation>(&structured) {
				Ok(location) if location.is_complete() => return Some(location),
				Ok(_) => warn!(?node, "Incomplete structured source marker; trying discrete markers."),
				Err(error) => warn!(?node, %error, "Malformed structured source marker; trying discrete markers."),
			}
		}
		let file = self.tree.attribute(node, self.namespace.file())?;
		let line = self.tree.attribute(node, self.namespace.line())?.trim().parse().ok()?;
		let column = self.tree.attribute(node, self.namespace.column())?.trim().parse().ok()?;
		let mut location = SourceLocation::new(file, line, column);
		if let Some(tag) = self.tree.tag_name(node) {
			location.element_type = Some(tag.to_ascii_lowercase());
		}
		Some(location).filter(SourceLocation::is_complete)
	}

	fn nearest_usage_ancestor(&self, node: NodeId) -> Option<NodeId> {
		let mut current = node;
		for _ in 0..MAX_ANCESTOR_DEPTH {
			current = self.tree.parent(current)?;
			if self.file_type(current) == Some(FileType::ComponentUsage) {
				return Some(current);
			}
		}
		trace!(?node, depth = MAX_ANCESTOR_DEPTH, "Ancestor depth limit reached.");
		None
	}

	#[must_use]
	pub fn element_id(&self, node: NodeId) -> Option<String> {
		self.tree.attribute(node, self.namespace.element_id()).filter(|id| !id.is_empty())
	}

	#[must_use]
	pub fn file_type(&self, node: NodeId) -> Option<FileType> {
		self.tree.attribute(node, self.namespace.file_type())?.parse().ok()
	}

	#[must_use]
	pub fn is_static_content(&self, node: NodeId) -> bool {
		self.flag(node, self.namespace.static_content())
	}

	#[must_use]
	pub fn is_static_class(&self, node: NodeId) -> bool {
		self.flag(node, self.namespace.static_class())
	}

	/// Whether the static-content marker is present at all, `true` or not.
	#[must_use]
	pub fn has_static_content_marker(&self, node: NodeId) -> bool {
		self.tree.has_attribute(node, self.namespace.static_content())
	}

	fn flag(&self, node: NodeId, name: &str) -> bool {
		matches!(self.tree.attribute(node, name).as_deref().map(str::trim), Some("true" | ""))
	}
}
