#![allow(dead_code)]

use design_mode::{
	bridge::{Transport, TransportError},
	protocol::{Envelope, MessageType},
	source::SourceLocation,
	update::{PersistError, Persistence, SaveRequest, SaveResult},
};
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::{
	cell::{Cell, RefCell},
	collections::VecDeque,
};

/// Keeps every posted envelope.
#[derive(Debug, Default)]
pub struct RecordingTransport {
	pub sent: RefCell<Vec<Envelope>>,
	pub counterpart: Cell<bool>,
	pub failing: Cell<bool>,
}

impl RecordingTransport {
	pub fn with_counterpart() -> Self {
		let transport = Self::default();
		transport.counterpart.set(true);
		transport
	}

	pub fn kinds(&self) -> Vec<MessageType> {
		self.sent.borrow().iter().map(|envelope| envelope.kind).collect()
	}

	pub fn of_kind(&self, kind: MessageType) -> Vec<Envelope> {
		self.sent.borrow().iter().filter(|envelope| envelope.kind == kind).cloned().collect()
	}

	pub fn clear(&self) {
		self.sent.borrow_mut().clear();
	}
}

impl Transport for RecordingTransport {
	fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
		if self.failing.get() {
			return Err(TransportError("refused".to_owned()));
		}
		self.sent.borrow_mut().push(envelope.clone());
		Ok(())
	}

	fn has_counterpart(&self) -> bool {
		self.counterpart.get()
	}
}

/// Answers from a script and records every call.
#[derive(Debug, Default)]
pub struct ScriptedPersistence {
	pub saves: RefCell<Vec<SaveRequest>>,
	pub batches: RefCell<Vec<Vec<SaveRequest>>>,
	pub static_checks: RefCell<Vec<SourceLocation>>,
	/// Each `save` pops one scripted failure; an empty script succeeds.
	pub save_failures: RefCell<VecDeque<PersistError>>,
	pub fail_all_saves: Cell<bool>,
	pub batch_failure: RefCell<Option<PersistError>>,
	pub is_static: Cell<bool>,
}

impl ScriptedPersistence {
	pub fn save_attempts(&self) -> usize {
		self.saves.borrow().len()
	}
}

impl Persistence for ScriptedPersistence {
	fn save(&self, request: SaveRequest) -> LocalBoxFuture<'static, Result<(), PersistError>> {
		self.saves.borrow_mut().push(request);
		let result = if self.fail_all_saves.get() {
			Err(PersistError::Failed("offline".to_owned()))
		} else {
			self.save_failures.borrow_mut().pop_front().map_or(Ok(()), Err)
		};
		future::ready(result).boxed_local()
	}

	fn save_batch(&self, requests: Vec<SaveRequest>) -> LocalBoxFuture<'static, Result<Vec<SaveResult>, PersistError>> {
		let results = requests.iter().map(|_| SaveResult { success: true, error: None }).collect();
		self.batches.borrow_mut().push(requests);
		let result = match self.batch_failure.borrow().clone() {
			Some(error) => Err(error),
			None => Ok(results),
		};
		future::ready(result).boxed_local()
	}

	fn check_static(&self, location: &SourceLocation) -> LocalBoxFuture<'static, Result<bool, PersistError>> {
		self.static_checks.borrow_mut().push(location.clone());
		future::ready(Ok(self.is_static.get())).boxed_local()
	}
}
