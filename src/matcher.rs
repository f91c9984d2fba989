//! Finds every rendering of one source position.
//!
//! Matching is conservative: a missed instance only leaves part of the page stale until reload, but a false match would
//! write an edit into unrelated content. Instances must agree on [`SourceLocation`], element id *and* [`NestingPath`].

use crate::{
	resolver::SourceResolver,
	source::{FileType, SourceLocation},
	tree::NodeId,
};
use core::fmt;
use tracing::{debug, instrument, trace};

/// How far nesting-path collection climbs. Deeper ancestors are not part of the path.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Component boundaries from the page root down to a node, as `fileName:componentName` tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NestingPath(Vec<String>);

impl NestingPath {
	#[must_use]
	pub fn tokens(&self) -> &[String] {
		&self.0
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Display for NestingPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0.join(" > "))
	}
}

#[derive(Debug, Clone)]
pub struct InstanceMatcher {
	resolver: SourceResolver,
}

impl InstanceMatcher {
	#[must_use]
	pub fn new(resolver: SourceResolver) -> Self {
		Self { resolver }
	}

	/// Collects the component boundaries above `node`.
	///
	/// Every definition or usage ancestor contributes a token; the nearest page-content ancestor is prepended.
	#[must_use]
	pub fn nesting_path(&self, node: NodeId) -> NestingPath {
		let tree = self.resolver.tree();
		let mut boundaries = Vec::new();
		let mut page_content = None;
		let mut current = node;
		for _ in 0..MAX_NESTING_DEPTH {
			current = match tree.parent(current) {
				Some(parent) => parent,
				None => break,
			};
			match self.resolver.file_type(current) {
				Some(FileType::ComponentDefinition | FileType::ComponentUsage) => {
					if let Some(token) = self.token(current) {
						boundaries.push(token);
					}
				}
				Some(FileType::PageContent) if page_content.is_none() => page_content = self.token(current),
				_ => (),
			}
		}
		boundaries.reverse();
		if let Some(page) = page_content {
			boundaries.insert(0, page);
		}
		NestingPath(boundaries)
	}

	fn token(&self, node: NodeId) -> Option<String> {
		let location = self.resolver.own_location(node)?;
		let component = location.component_name.or(location.element_type).unwrap_or_default();
		Some(format!("{}:{}", location.file_name, component))
	}

	/// Every rendered instance of `location` that `node` belongs to, in document order. Always contains `node`.
	#[instrument(skip(self, location), fields(%location))]
	pub fn find_instances(&self, node: NodeId, location: &SourceLocation) -> Vec<NodeId> {
		let element_id = match self.resolver.element_id(node) {
			Some(element_id) => element_id,
			None => {
				trace!("No element id; matching only the node itself.");
				return vec![node];
			}
		};
		let file_type = self.resolver.file_type(node);
		let path = self.nesting_path(node);
		if cfg!(feature = "log-paths") {
			debug!(%path, "Matching instances.");
		}

		let mut instances: Vec<NodeId> = self
			.resolver
			.tree()
			.nodes_with_attribute(self.resolver.namespace().element_id(), &element_id)
			.into_iter()
			.filter(|&candidate| candidate == node || self.is_same_instance_position(candidate, location, file_type, &path))
			.collect();
		if !instances.contains(&node) {
			instances.insert(0, node);
		}
		debug!("Matched {} instance(s).", instances.len());
		instances
	}

	/// [`find_instances`](`InstanceMatcher::find_instances`), restricted to nodes whose static-content flag agrees with `node`'s.
	#[must_use]
	pub fn find_content_instances(&self, node: NodeId, location: &SourceLocation) -> Vec<NodeId> {
		let is_static = self.resolver.is_static_content(node);
		self.find_instances(node, location)
			.into_iter()
			.filter(|&candidate| candidate == node || self.resolver.is_static_content(candidate) == is_static)
			.collect()
	}

	fn is_same_instance_position(&self, candidate: NodeId, location: &SourceLocation, file_type: Option<FileType>, path: &NestingPath) -> bool {
		let candidate_location = match self.resolver.resolve(candidate) {
			Some(candidate_location) => candidate_location,
			None => return false,
		};
		if !candidate_location.matches(location) {
			return false;
		}
		if self.resolver.file_type(candidate) != file_type {
			return false;
		}
		let candidate_path = self.nesting_path(candidate);
		if &candidate_path != path {
			if cfg!(feature = "log-paths") {
				trace!(?candidate, %candidate_path, "Nesting path differs.");
			}
			return false;
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{namespace::Namespace, tree::MemoryTree};
	use std::rc::Rc;

	fn marked<'a>(file: &'a str, file_type: &'a str) -> [(&'a str, &'a str); 4] {
		[("data-dm-file", file), ("data-dm-line", "1"), ("data-dm-column", "1"), ("data-dm-file-type", file_type)]
	}

	#[test]
	fn path_runs_from_page_down() {
		let tree = Rc::new(MemoryTree::new());
		let outer = tree.create_element("body", None, &marked("src/Layout.tsx", "page-content"));
		let main = tree.create_element("main", Some(outer), &marked("src/App.tsx", "page-content"));
		let usage = tree.create_element("section", Some(main), &marked("src/App.tsx", "component-usage"));
		let definition = tree.create_element("article", Some(usage), &marked("src/Card.tsx", "component-definition"));
		let node = tree.create_element("p", Some(definition), &[]);

		let matcher = InstanceMatcher::new(SourceResolver::new(Rc::new(Namespace::default()), tree));
		let path = matcher.nesting_path(node);
		assert_eq!(path.tokens(), ["src/App.tsx:main", "src/App.tsx:section", "src/Card.tsx:article"]);
		assert_eq!(path.to_string(), "src/App.tsx:main > src/App.tsx:section > src/Card.tsx:article");
	}

	#[test]
	fn unmarked_ancestors_leave_path_empty() {
		let tree = Rc::new(MemoryTree::new());
		let parent = tree.create_element("div", None, &[]);
		let node = tree.create_element("span", Some(parent), &[]);
		let matcher = InstanceMatcher::new(SourceResolver::new(Rc::new(Namespace::default()), tree));
		assert!(matcher.nesting_path(node).is_empty());
	}
}
