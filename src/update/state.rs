use crate::{
	protocol::{EditKind, ErrorCode},
	source::SourceLocation,
	tree::{NodeId, TreeError},
};
use core::fmt;
use serde::Serialize;
use std::{cell::RefCell, rc::Rc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UpdateId(pub u64);

impl fmt::Display for UpdateId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "update-{}", self.0)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
	/// The inline `style` attribute.
	StyleUpdate,
	/// The `class` attribute.
	ClassUpdate,
	/// Text content.
	ContentUpdate,
	/// Any other attribute, by name.
	AttributeUpdate(String),
	/// A host-issued group. Members keep their own operation and reference the group through [`UpdateState::batch`].
	BatchUpdate,
}

impl Operation {
	/// The attribute the value lives in, if it is an attribute at all.
	#[must_use]
	pub fn attribute(&self) -> Option<&str> {
		match self {
			Operation::StyleUpdate => Some("style"),
			Operation::ClassUpdate => Some("class"),
			Operation::AttributeUpdate(name) => Some(name),
			Operation::ContentUpdate | Operation::BatchUpdate => None,
		}
	}

	/// How the persistence collaborator files this edit.
	#[must_use]
	pub fn edit_kind(&self) -> EditKind {
		match self {
			Operation::ContentUpdate => EditKind::Content,
			Operation::StyleUpdate | Operation::ClassUpdate | Operation::AttributeUpdate(_) | Operation::BatchUpdate => EditKind::Style,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
	Pending,
	Processing,
	Completed,
	Failed,
	Reverted,
}

/// Where an edit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
	/// Requested through the pipeline; the render is written by the pipeline.
	Pipeline,
	/// Seen by the mutation observer; the render already shows the new value.
	Observed,
}

/// One edit's lifecycle record. Status changes in place; records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
	pub id: UpdateId,
	pub operation: Operation,
	pub location: SourceLocation,
	#[serde(skip)]
	pub node: NodeId,
	pub old_value: String,
	pub new_value: String,
	pub status: Status,
	pub retry_count: u32,
	pub timestamp: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub origin: Origin,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub batch: Option<u64>,
}

impl UpdateState {
	#[must_use]
	pub fn is_terminal(&self) -> bool {
		matches!(self.status, Status::Completed | Status::Failed | Status::Reverted)
	}
}

pub type SharedUpdate = Rc<RefCell<UpdateState>>;

/// Display-only log entry derived from an [`UpdateState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Modification {
	pub id: UpdateId,
	/// `file:line:column` of the edited element.
	pub element: String,
	#[serde(rename = "type")]
	pub kind: Operation,
	pub old_value: String,
	pub new_value: String,
	pub timestamp: u64,
}

impl From<&UpdateState> for Modification {
	fn from(update: &UpdateState) -> Self {
		Self {
			id: update.id,
			element: update.location.to_string(),
			kind: update.operation.clone(),
			old_value: update.old_value.clone(),
			new_value: update.new_value.clone(),
			timestamp: update.timestamp,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
	#[error("source location {0} is incomplete")]
	IncompleteLocation(SourceLocation),
	#[error("value is {length} characters long, more than the allowed {max}")]
	TooLong { length: usize, max: usize },
	#[error("{0:?} cannot be applied on its own")]
	NotApplicable(Operation),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
	#[error("persistence call failed: {0}")]
	Failed(String),
	#[error("persistence rejected the edit: {0}")]
	Rejected(String),
}

/// Why an update ended in [`Status::Failed`] (or never started).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error(transparent)]
	Persist(#[from] PersistError),
	#[error(transparent)]
	Render(#[from] TreeError),
	#[error("{0} is already being processed")]
	InFlight(UpdateId),
	#[error(transparent)]
	Edit(#[from] super::edit::EditError),
}

impl UpdateError {
	/// The code reported to the host.
	#[must_use]
	pub fn code(&self) -> ErrorCode {
		match self {
			UpdateError::Validation(_) | UpdateError::Edit(_) => ErrorCode::Validation,
			UpdateError::Persist(_) => ErrorCode::Persistence,
			UpdateError::Render(_) | UpdateError::InFlight(_) => ErrorCode::Internal,
		}
	}
}
