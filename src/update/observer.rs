//! Turns the render tree's mutation stream into edits, so changes made outside the pipeline land in the same history.

use super::{
	edit::{EditError, EditManager},
	state::{Operation, UpdateState},
};
use crate::{
	resolver::SourceResolver,
	tree::{MutationEvent, MutationKind, NodeId},
};
use core::cell::Cell;
use hashbrown::HashSet;
use tracing::{debug, instrument, trace, trace_span};

#[derive(Debug)]
pub struct ObserverManager {
	resolver: SourceResolver,
	enabled: Cell<bool>,
}

impl ObserverManager {
	#[must_use]
	pub fn new(resolver: SourceResolver) -> Self {
		Self { resolver, enabled: Cell::new(true) }
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.enabled.set(enabled);
	}

	#[must_use]
	pub fn is_enabled(&self) -> bool {
		self.enabled.get()
	}

	/// Captures an edit for each qualifying event in `events`, which must be in the order they happened.
	///
	/// Qualifying are text changes on source-mapped nodes and `class`/`style` changes. Events between the addition and
	/// the removal of a node's ignore-mutation marker were written by the pipeline itself and are skipped. Markers
	/// still present at the end are cleared.
	#[instrument(skip(self, events, edits), fields(count = events.len()))]
	pub fn process(&self, events: Vec<MutationEvent>, edits: &EditManager) -> Vec<UpdateState> {
		let tree = self.resolver.tree();
		let ignore = self.resolver.namespace().ignore_mutation();
		let mut marked = HashSet::<NodeId>::new();
		let mut captured = Vec::new();
		let enabled = self.enabled.get();
		if !enabled {
			trace!("Observer disabled; discarding events.");
		}

		for (i, event) in events.iter().enumerate() {
			let span = trace_span!("Mutation", target = ?event.target);
			let _enter = span.enter();
			let (operation, old_value) = match &event.kind {
				MutationKind::Attribute { name, old_value } if name == ignore => {
					if old_value.is_none() {
						marked.insert(event.target);
					} else {
						marked.remove(&event.target);
					}
					continue;
				}
				_ if !enabled => continue,
				_ if marked.contains(&event.target) => {
					trace!("Written by the pipeline.");
					continue;
				}
				_ if !tree.contains(event.target) => {
					trace!("Target is gone.");
					continue;
				}
				MutationKind::Text { old_value: Some(old_value) } => (Operation::ContentUpdate, old_value.clone()),
				MutationKind::Text { old_value: None } => {
					trace!("Text change without a previous value.");
					continue;
				}
				MutationKind::Attribute { name, old_value } => match name.as_str() {
					"class" => (Operation::ClassUpdate, old_value.clone().unwrap_or_default()),
					"style" => (Operation::StyleUpdate, old_value.clone().unwrap_or_default()),
					_ => continue,
				},
			};
			if operation == Operation::ContentUpdate && self.resolver.resolve(event.target).is_none() {
				trace!("Text changed on a node without source mapping.");
				continue;
			}

			// A later event on the same target and kind carries the value this one changed to.
			let later = events[i + 1..].iter().find(|later| later.target == event.target && same_kind(&later.kind, &event.kind));
			let result = match later {
				Some(later) => {
					let new_value = match &later.kind {
						MutationKind::Text { old_value } | MutationKind::Attribute { old_value, .. } => old_value.clone().unwrap_or_default(),
					};
					if new_value == old_value {
						Err(EditError::Unchanged)
					} else {
						edits.capture_observed(event.target, operation, old_value).map(|mut update| {
							update.new_value = new_value;
							update
						})
					}
				}
				None => edits.capture_observed(event.target, operation, old_value),
			};
			match result {
				Ok(update) => captured.push(update),
				Err(error) => debug!(%error, "Ignoring observed mutation."),
			}
		}
		self.clear_markers(marked);
		captured
	}

	fn clear_markers(&self, marked: HashSet<NodeId>) {
		let tree = self.resolver.tree();
		let ignore = self.resolver.namespace().ignore_mutation();
		for node in marked.into_iter().filter(|&node| tree.has_attribute(node, ignore)) {
			if let Err(error) = tree.remove_attribute(node, ignore) {
				trace!(%error, "Could not clear ignore marker.");
			}
		}
	}
}

fn same_kind(a: &MutationKind, b: &MutationKind) -> bool {
	match (a, b) {
		(MutationKind::Text { .. }, MutationKind::Text { .. }) => true,
		(MutationKind::Attribute { name: a, .. }, MutationKind::Attribute { name: b, .. }) => a == b,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		clock::ManualClock,
		namespace::Namespace,
		tree::{MemoryTree, RenderTree},
	};
	use std::rc::Rc;

	fn setup() -> (Rc<MemoryTree>, ObserverManager, EditManager, NodeId) {
		let tree = Rc::new(MemoryTree::new());
		let resolver = SourceResolver::new(Rc::new(Namespace::default()), tree.clone());
		let node = tree.create_text_element("h1", None, &[("data-dm-file", "src/Hero.tsx"), ("data-dm-line", "10"), ("data-dm-column", "4"), ("class", "a")], "Hi");
		tree.take_mutations();
		(tree, ObserverManager::new(resolver.clone()), EditManager::new(resolver, Rc::new(ManualClock::new())), node)
	}

	#[test]
	fn pipeline_writes_are_skipped_and_unmarked() {
		let (tree, observer, edits, node) = setup();
		tree.set_attribute(node, "data-dm-ignore-mutation", "").unwrap();
		tree.set_attribute(node, "class", "b").unwrap();
		assert!(observer.process(tree.take_mutations(), &edits).is_empty());
		assert!(!tree.has_attribute(node, "data-dm-ignore-mutation"));
	}

	#[test]
	fn successive_host_edits_keep_their_own_values() {
		let (tree, observer, edits, node) = setup();
		tree.set_attribute(node, "class", "b").unwrap();
		tree.set_attribute(node, "class", "c").unwrap();
		let updates = observer.process(tree.take_mutations(), &edits);
		let values: Vec<_> = updates.iter().map(|update| (update.old_value.as_str(), update.new_value.as_str())).collect();
		assert_eq!(values, [("a", "b"), ("b", "c")]);
		assert!(updates.iter().all(|update| update.origin == crate::update::Origin::Observed));
	}

	#[test]
	fn disabled_observer_only_clears_markers() {
		let (tree, observer, edits, node) = setup();
		observer.set_enabled(false);
		tree.set_attribute(node, "data-dm-ignore-mutation", "").unwrap();
		tree.set_attribute(node, "class", "b").unwrap();
		tree.set_attribute(node, "style", "color: red").unwrap();
		assert!(observer.process(tree.take_mutations(), &edits).is_empty());
		assert!(!tree.has_attribute(node, "data-dm-ignore-mutation"));
	}

	#[test]
	fn host_edits_around_a_pipeline_write_are_kept() {
		let (tree, observer, edits, node) = setup();
		tree.set_attribute(node, "class", "b").unwrap();
		tree.set_attribute(node, "data-dm-ignore-mutation", "").unwrap();
		tree.set_attribute(node, "class", "c").unwrap();
		tree.remove_attribute(node, "data-dm-ignore-mutation").unwrap();
		tree.set_attribute(node, "class", "d").unwrap();

		let updates = observer.process(tree.take_mutations(), &edits);
		let values: Vec<_> = updates.iter().map(|update| (update.old_value.as_str(), update.new_value.as_str())).collect();
		assert_eq!(values, [("a", "b"), ("c", "d")]);
	}

	#[test]
	fn text_without_previous_value_is_skipped() {
		let (_, observer, edits, node) = setup();
		let events = vec![MutationEvent { target: node, kind: MutationKind::Text { old_value: None } }];
		assert!(observer.process(events, &edits).is_empty());
	}
}
