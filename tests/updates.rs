mod support;

use design_mode::{
	clock::ManualClock,
	config::UpdateConfig,
	protocol::ErrorCode,
	resolver::SourceResolver,
	tree::MemoryTree,
	update::{EditError, Operation, Origin, PersistError, Status, UpdateError, UpdateEvent, UpdateManager},
	Namespace, NodeId, RenderTree,
};
use futures::executor::block_on;
use std::{cell::RefCell, rc::Rc};
use support::ScriptedPersistence;

struct Fixture {
	tree: Rc<MemoryTree>,
	persistence: Rc<ScriptedPersistence>,
	clock: Rc<ManualClock>,
	updates: UpdateManager,
	events: Rc<RefCell<Vec<UpdateEvent>>>,
}

fn fixture_with(config: &UpdateConfig) -> Fixture {
	let tree = Rc::new(MemoryTree::new());
	let persistence = Rc::new(ScriptedPersistence::default());
	let clock = Rc::new(ManualClock::new());
	let resolver = SourceResolver::new(Rc::new(Namespace::default()), tree.clone());
	let updates = UpdateManager::new(resolver, persistence.clone(), config, clock.clone());
	let events = Rc::new(RefCell::new(Vec::new()));
	{
		let events = Rc::clone(&events);
		updates.subscribe(move |event| events.borrow_mut().push(event.clone()));
	}
	Fixture { tree, persistence, clock, updates, events }
}

fn fixture() -> Fixture {
	fixture_with(&UpdateConfig::default())
}

fn button(tree: &MemoryTree, parent: Option<NodeId>) -> NodeId {
	tree.create_text_element(
		"button",
		parent,
		&[
			("data-dm-file", "src/Button.tsx"),
			("data-dm-line", "8"),
			("data-dm-column", "3"),
			("data-dm-id", "button"),
			("data-dm-static-content", "true"),
			("data-dm-static-class", "true"),
			("class", "p-2"),
		],
		"Save",
	)
}

#[test]
fn class_edit_round_trip() {
	let f = fixture();
	let node = button(&f.tree, None);

	let update = block_on(f.updates.update_class(node, "p-4")).unwrap();
	assert_eq!(update.status, Status::Completed);
	assert_eq!(update.old_value, "p-2");
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-4"));

	let saves = f.persistence.saves.borrow();
	assert_eq!(saves.len(), 1);
	assert_eq!((saves[0].file_path.as_str(), saves[0].line, saves[0].column), ("src/Button.tsx", 8, 3));
	assert_eq!(saves[0].new_value, "p-4");
	assert_eq!(saves[0].original_value.as_deref(), Some("p-2"));

	let events = f.events.borrow();
	assert_eq!(events.len(), 2);
	assert!(matches!(events[0], UpdateEvent::Started(_)));
	assert!(matches!(events[1], UpdateEvent::Completed(_)));
	assert_eq!(f.updates.modifications().len(), 1);
	assert_eq!(f.updates.modifications()[0].element, "src/Button.tsx:8:3");
}

#[test]
fn repeating_an_edit_changes_nothing() {
	let f = fixture();
	let node = button(&f.tree, None);

	block_on(f.updates.update_class(node, "p-4")).unwrap();
	let again = block_on(f.updates.update_class(node, "p-4"));
	assert_eq!(again, Err(UpdateError::Edit(EditError::Unchanged)));
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-4"));
	assert_eq!(f.persistence.save_attempts(), 1);
	assert_eq!(f.updates.updates().len(), 1);
}

#[test]
fn persistence_is_attempted_at_most_max_retries_plus_one_times() {
	let f = fixture();
	f.persistence.fail_all_saves.set(true);
	let node = button(&f.tree, None);

	let result = block_on(f.updates.update_class(node, "p-4"));
	assert!(matches!(result, Err(UpdateError::Persist(PersistError::Failed(_)))));
	assert_eq!(f.persistence.save_attempts(), 4);

	let update = &f.updates.updates()[0];
	assert_eq!(update.status, Status::Failed);
	assert_eq!(update.retry_count, 3);
	assert!(update.error.is_some());
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-2"), "render is restored");
	assert!(!f.updates.can_undo());
	assert!(f.events.borrow().iter().any(|event| matches!(event, UpdateEvent::Failed { code: ErrorCode::Persistence, .. })));
	assert!(!f.updates.service().is_in_flight(update.id));
}

#[test]
fn transient_failure_is_retried() {
	let f = fixture();
	f.persistence.save_failures.borrow_mut().push_back(PersistError::Failed("busy".to_owned()));
	let node = button(&f.tree, None);

	let update = block_on(f.updates.update_class(node, "p-4")).unwrap();
	assert_eq!(update.status, Status::Completed);
	assert_eq!(update.retry_count, 1);
	assert_eq!(f.persistence.save_attempts(), 2);
}

#[test]
fn validation_failures_are_terminal() {
	let f = fixture_with(&UpdateConfig { max_value_length: 5, ..UpdateConfig::default() });
	let node = button(&f.tree, None);

	let result = block_on(f.updates.update_class(node, "p-4 m-2"));
	assert!(matches!(result, Err(UpdateError::Validation(_))));
	assert_eq!(f.persistence.save_attempts(), 0);
	assert_eq!(f.updates.updates()[0].retry_count, 0);
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-2"));
}

#[test]
fn computed_content_is_refused() {
	let f = fixture();
	let node = f.tree.create_text_element("p", None, &[("data-dm-file", "src/A.tsx"), ("data-dm-line", "1"), ("data-dm-column", "1")], "{greeting}");
	let result = block_on(f.updates.update_content(node, "Hi"));
	assert!(matches!(result, Err(UpdateError::Edit(EditError::NotStaticContent(_)))));
	assert_eq!(f.updates.updates().len(), 0);
}

#[test]
fn batch_completes_or_fails_as_a_whole() {
	let f = fixture();
	let list = f.tree.create_element("ul", None, &[]);
	let buttons: Vec<NodeId> = (0..3).map(|_| button(&f.tree, Some(list))).collect();

	let updates = block_on(f.updates.update_everywhere(buttons[0], Operation::ClassUpdate, "p-4")).unwrap();
	assert_eq!(updates.len(), 3);
	assert!(updates.iter().all(|update| update.status == Status::Completed));
	assert_eq!(f.persistence.batches.borrow().len(), 1);
	assert_eq!(f.persistence.batches.borrow()[0].len(), 3);
	assert_eq!(updates[0].batch, updates[2].batch);

	*f.persistence.batch_failure.borrow_mut() = Some(PersistError::Failed("offline".to_owned()));
	let result = block_on(f.updates.update_everywhere(buttons[1], Operation::ClassUpdate, "p-8"));
	assert!(result.is_err());
	assert_eq!(f.persistence.batches.borrow().len(), 2);
	let failed: Vec<_> = f.updates.updates().into_iter().filter(|update| update.new_value == "p-8").collect();
	assert_eq!(failed.len(), 3);
	assert!(failed.iter().all(|update| update.status == Status::Failed));
	for node in buttons {
		assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-4"));
	}
}

#[test]
fn one_refused_member_fails_the_whole_batch() {
	let f = fixture_with(&UpdateConfig { max_value_length: 8, ..UpdateConfig::default() });
	let first = button(&f.tree, None);
	let second = button(&f.tree, None);
	let short = f.updates.edits().capture(first, Operation::ClassUpdate, "p-4").unwrap();
	let long = f.updates.edits().capture(second, Operation::ClassUpdate, "p-4 text-center").unwrap();

	let result = block_on(f.updates.process_batch(vec![short, long]));
	assert!(matches!(result, Err(UpdateError::Validation(_))));
	assert!(f.persistence.batches.borrow().is_empty());
	let updates = f.updates.updates();
	assert_eq!(updates.len(), 2);
	assert!(updates.iter().all(|update| update.status == Status::Failed));
	for node in [first, second] {
		assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-2"));
	}
	let codes: Vec<_> = f
		.events
		.borrow()
		.iter()
		.filter_map(|event| match event {
			UpdateEvent::Failed { code, .. } => Some(*code),
			_ => None,
		})
		.collect();
	assert_eq!(codes, [ErrorCode::Validation, ErrorCode::Validation]);
}

#[test]
fn reverse_edit_restores_the_original() {
	let f = fixture();
	let node = button(&f.tree, None);

	block_on(f.updates.update_class(node, "p-4")).unwrap();
	let back = block_on(f.updates.update_class(node, "p-2")).unwrap();
	assert_eq!((back.old_value.as_str(), back.new_value.as_str()), ("p-4", "p-2"));
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-2"));
	let saves = f.persistence.saves.borrow();
	assert_eq!(saves.len(), 2);
	assert_eq!((saves[1].original_value.as_deref(), saves[1].new_value.as_str()), (Some("p-4"), "p-2"));
}

#[test]
fn undo_and_redo_replay_values() {
	let f = fixture();
	let node = button(&f.tree, None);
	block_on(f.updates.update_content(node, "Store")).unwrap();

	let undone = block_on(f.updates.undo()).unwrap();
	assert_eq!(undone.status, Status::Reverted);
	assert_eq!(f.tree.text_content(node).as_deref(), Some("Save"));
	assert_eq!(f.persistence.saves.borrow().last().map(|save| save.new_value.clone()).as_deref(), Some("Save"));
	assert!(f.updates.can_redo());

	let redone = block_on(f.updates.redo()).unwrap();
	assert_eq!(redone.status, Status::Completed);
	assert_eq!(f.tree.text_content(node).as_deref(), Some("Store"));
	assert!(block_on(f.updates.redo()).is_none());
}

#[test]
fn pipeline_writes_are_not_observed_again() {
	let f = fixture();
	let node = button(&f.tree, None);
	block_on(f.updates.update_class(node, "p-4")).unwrap();

	block_on(f.updates.tick());
	assert_eq!(f.updates.updates().len(), 1);
	assert!(!f.tree.has_attribute(node, "data-dm-ignore-mutation"));
	assert_eq!(f.persistence.save_attempts(), 1);
}

#[test]
fn edits_made_outside_the_pipeline_are_persisted() {
	let f = fixture();
	let node = button(&f.tree, None);
	f.tree.set_attribute(node, "class", "p-6").unwrap();

	block_on(f.updates.tick());
	let updates = f.updates.updates();
	assert_eq!(updates.len(), 1);
	assert_eq!(updates[0].origin, Origin::Observed);
	assert_eq!((updates[0].old_value.as_str(), updates[0].new_value.as_str()), ("p-2", "p-6"));
	assert_eq!(updates[0].status, Status::Completed);
	assert_eq!(f.persistence.save_attempts(), 1);
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-6"));
}

#[test]
fn outside_edit_next_to_a_pipeline_write_is_kept() {
	let f = fixture();
	let node = button(&f.tree, None);
	f.tree.set_attribute(node, "class", "p-3").unwrap();
	block_on(f.updates.update_content(node, "Hello")).unwrap();
	assert!(!f.tree.has_attribute(node, "data-dm-ignore-mutation"));

	block_on(f.updates.tick());
	let observed: Vec<_> = f.updates.updates().into_iter().filter(|update| update.origin == Origin::Observed).collect();
	assert_eq!(observed.len(), 1);
	assert_eq!(observed[0].operation, Operation::ClassUpdate);
	assert_eq!((observed[0].old_value.as_str(), observed[0].new_value.as_str()), ("p-2", "p-3"));
	assert_eq!(observed[0].status, Status::Completed);
	let saves = f.persistence.saves.borrow();
	let values: Vec<_> = saves.iter().map(|save| save.new_value.as_str()).collect();
	assert_eq!(values, ["Hello", "p-3"]);
}

#[test]
fn queued_edits_flush_once_the_window_is_idle() {
	let f = fixture();
	let node = button(&f.tree, None);
	f.updates.observer().set_enabled(false);

	let first = f.updates.queue(node, Operation::ClassUpdate, "p-3").unwrap();
	f.clock.advance_millis(200);
	let second = f.updates.queue(node, Operation::ClassUpdate, "p-4").unwrap();
	assert_eq!(first, second);
	assert_eq!(f.updates.queued(), 1);

	f.clock.advance_millis(200);
	block_on(f.updates.tick());
	assert!(f.persistence.batches.borrow().is_empty(), "window restarted by the second request");

	f.clock.advance_millis(100);
	block_on(f.updates.tick());
	let batches = f.persistence.batches.borrow();
	assert_eq!(batches.len(), 1);
	assert_eq!(batches[0][0].new_value, "p-4");
	assert_eq!(f.tree.attribute(node, "class").as_deref(), Some("p-4"));
	assert_eq!(f.updates.get(first).map(|update| update.status), Some(Status::Completed));
}
