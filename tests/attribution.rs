use design_mode::{matcher::InstanceMatcher, resolver::SourceResolver, source::SourceLocation, tree::MemoryTree, Namespace, NodeId, RenderTree};
use std::rc::Rc;

fn setup() -> (Rc<MemoryTree>, SourceResolver, InstanceMatcher) {
	let tree = Rc::new(MemoryTree::new());
	let resolver = SourceResolver::new(Rc::new(Namespace::default()), tree.clone());
	let matcher = InstanceMatcher::new(resolver.clone());
	(tree, resolver, matcher)
}

/// A `<Card>` usage on the page at `line`, with one title element from the card's own template inside.
fn card(tree: &MemoryTree, parent: NodeId, line: &str) -> NodeId {
	let usage = tree.create_element(
		"div",
		Some(parent),
		&[("data-dm-file", "src/Page.tsx"), ("data-dm-line", line), ("data-dm-column", "4"), ("data-dm-file-type", "component-usage")],
	);
	tree.create_text_element(
		"h2",
		Some(usage),
		&[
			("data-dm-source", r#"{"fileName":"src/Card.tsx","lineNumber":7,"columnNumber":6,"componentName":"Card"}"#),
			("data-dm-id", "card-title"),
			("data-dm-file-type", "component-definition"),
			("data-dm-static-content", "true"),
		],
		"Title",
	)
}

fn page(tree: &MemoryTree) -> NodeId {
	tree.create_element("main", None, &[("data-dm-file", "src/Page.tsx"), ("data-dm-line", "1"), ("data-dm-column", "1"), ("data-dm-file-type", "page-content")])
}

#[test]
fn resolution_ignores_unrelated_nodes() {
	let (tree, resolver, _) = setup();
	let root = page(&tree);
	let title = card(&tree, root, "3");
	let before = resolver.resolve(title);

	let other = tree.create_element("aside", Some(root), &[("data-dm-file", "src/Other.tsx"), ("data-dm-line", "2"), ("data-dm-column", "2")]);
	tree.create_element("p", Some(other), &[("data-dm-children-source", "src/Else.tsx:9:9")]);
	card(&tree, root, "8");

	assert_eq!(resolver.resolve(title), before);
	assert_eq!(before, Some(SourceLocation::new("src/Card.tsx", 7, 6).with_component("Card")));
}

#[test]
fn explicit_children_source_wins() {
	let (tree, resolver, _) = setup();
	let root = page(&tree);
	let slot = tree.create_element(
		"span",
		Some(root),
		&[("data-dm-file", "src/Card.tsx"), ("data-dm-line", "12"), ("data-dm-column", "3"), ("data-dm-children-source", "C:/site/src/Page.tsx:30:11")],
	);
	assert_eq!(resolver.resolve(slot), Some(SourceLocation::new("C:/site/src/Page.tsx", 30, 11)));
	assert_eq!(resolver.resolve_children_source(slot), Some(SourceLocation::new("C:/site/src/Page.tsx", 30, 11)));
}

#[test]
fn every_rendering_of_a_list_item_is_found() {
	let (tree, resolver, matcher) = setup();
	let root = page(&tree);
	let list = tree.create_element("ul", Some(root), &[]);
	let titles: Vec<NodeId> = (0..3).map(|_| card(&tree, list, "5")).collect();

	let location = resolver.resolve(titles[1]).unwrap();
	assert_eq!(matcher.find_instances(titles[1], &location), titles);
}

#[test]
fn instances_under_another_component_are_not_matched() {
	let (tree, resolver, matcher) = setup();
	let root = page(&tree);
	let here = card(&tree, root, "5");
	let header = tree.create_element(
		"header",
		Some(root),
		&[
			("data-dm-source", r#"{"fileName":"src/Header.tsx","lineNumber":2,"columnNumber":2,"componentName":"Header"}"#),
			("data-dm-file-type", "component-definition"),
		],
	);
	let elsewhere = card(&tree, header, "5");

	let location = resolver.resolve(here).unwrap();
	assert_eq!(resolver.resolve(elsewhere), Some(location.clone()));
	assert_ne!(matcher.nesting_path(here), matcher.nesting_path(elsewhere));
	assert_eq!(matcher.find_instances(here, &location), vec![here]);
}

#[test]
fn nodes_without_identity_only_match_themselves() {
	let (tree, resolver, matcher) = setup();
	let root = page(&tree);
	let a = tree.create_element("p", Some(root), &[("data-dm-file", "src/Page.tsx"), ("data-dm-line", "4"), ("data-dm-column", "2")]);
	tree.create_element("p", Some(root), &[("data-dm-file", "src/Page.tsx"), ("data-dm-line", "4"), ("data-dm-column", "2")]);
	let location = resolver.resolve(a).unwrap();
	assert_eq!(matcher.find_instances(a, &location), vec![a]);
}

#[test]
fn content_instances_agree_on_static_content() {
	let (tree, resolver, matcher) = setup();
	let root = page(&tree);
	let list = tree.create_element("ul", Some(root), &[]);
	let a = card(&tree, list, "5");
	let b = card(&tree, list, "5");
	let c = card(&tree, list, "5");
	tree.remove_attribute(c, "data-dm-static-content").unwrap();

	let location = resolver.resolve(a).unwrap();
	assert_eq!(matcher.find_instances(a, &location), vec![a, b, c]);
	assert_eq!(matcher.find_content_instances(a, &location), vec![a, b]);
}
