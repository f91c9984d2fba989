//! The message catalogue exchanged between an embedded page and its host.
//!
//! On the wire every message is a flat record `{type, payload?, requestId?, timestamp?}`. [`Envelope`] is that record
//! with an untyped payload; [`Message`] is the typed view.

use crate::source::SourceLocation;
use core::{fmt, str::FromStr};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The allow-list of message types. Anything else is rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
	ElementSelected,
	ElementDeselected,
	ContentUpdated,
	StyleUpdated,
	AddToChat,
	CopyElement,
	Heartbeat,
	BridgeReady,
	Acknowledgement,
	Error,
	ToggleDesignMode,
	UpdateStyle,
	UpdateContent,
	BatchUpdate,
	GetElementState,
	ElementStateResponse,
	HealthCheck,
	HealthCheckResponse,
}

impl MessageType {
	pub const ALL: [MessageType; 18] = [
		MessageType::ElementSelected,
		MessageType::ElementDeselected,
		MessageType::ContentUpdated,
		MessageType::StyleUpdated,
		MessageType::AddToChat,
		MessageType::CopyElement,
		MessageType::Heartbeat,
		MessageType::BridgeReady,
		MessageType::Acknowledgement,
		MessageType::Error,
		MessageType::ToggleDesignMode,
		MessageType::UpdateStyle,
		MessageType::UpdateContent,
		MessageType::BatchUpdate,
		MessageType::GetElementState,
		MessageType::ElementStateResponse,
		MessageType::HealthCheck,
		MessageType::HealthCheckResponse,
	];

	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			MessageType::ElementSelected => "ELEMENT_SELECTED",
			MessageType::ElementDeselected => "ELEMENT_DESELECTED",
			MessageType::ContentUpdated => "CONTENT_UPDATED",
			MessageType::StyleUpdated => "STYLE_UPDATED",
			MessageType::AddToChat => "ADD_TO_CHAT",
			MessageType::CopyElement => "COPY_ELEMENT",
			MessageType::Heartbeat => "HEARTBEAT",
			MessageType::BridgeReady => "BRIDGE_READY",
			MessageType::Acknowledgement => "ACKNOWLEDGEMENT",
			MessageType::Error => "ERROR",
			MessageType::ToggleDesignMode => "TOGGLE_DESIGN_MODE",
			MessageType::UpdateStyle => "UPDATE_STYLE",
			MessageType::UpdateContent => "UPDATE_CONTENT",
			MessageType::BatchUpdate => "BATCH_UPDATE",
			MessageType::GetElementState => "GET_ELEMENT_STATE",
			MessageType::ElementStateResponse => "ELEMENT_STATE_RESPONSE",
			MessageType::HealthCheck => "HEALTH_CHECK",
			MessageType::HealthCheckResponse => "HEALTH_CHECK_RESPONSE",
		}
	}

	/// Requests that get a full response instead of an acknowledgement.
	#[must_use]
	pub fn is_answered_in_kind(self) -> bool {
		matches!(self, MessageType::GetElementState | MessageType::HealthCheck)
	}

	/// Messages that answer a request rather than start one.
	#[must_use]
	pub fn is_response(self) -> bool {
		matches!(self, MessageType::Acknowledgement | MessageType::Error | MessageType::ElementStateResponse | MessageType::HealthCheckResponse)
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageType {
	type Err = ProtocolError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageType::ALL.iter().copied().find(|t| t.as_str() == s).ok_or_else(|| ProtocolError::UnknownType(s.to_owned()))
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
	#[error("message is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("message is not an object with a string `type`")]
	Untyped,
	#[error("message type {0:?} is not allowed")]
	UnknownType(String),
	#[error("payload of {kind} is malformed: {source}")]
	Payload { kind: MessageType, source: serde_json::Error },
}

/// A message as it travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	#[serde(rename = "type")]
	pub kind: MessageType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<u64>,
}

impl Envelope {
	/// Parses a received frame, checking the type against the allow-list before anything else.
	///
	/// # Errors
	///
	/// Iff the frame is not JSON, has no string `type`, names a type outside the allow-list or is otherwise malformed.
	pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
		let value: Value = serde_json::from_str(frame)?;
		Self::from_value(value)
	}

	/// # Errors
	///
	/// See [`Envelope::parse`].
	pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
		let kind = value.get("type").and_then(Value::as_str).ok_or(ProtocolError::Untyped)?;
		let kind: MessageType = kind.parse()?;
		serde_json::from_value(value).map_err(|source| ProtocolError::Payload { kind, source })
	}

	/// # Errors
	///
	/// Iff the envelope cannot be represented as JSON, which does not happen for envelopes built from [`Message`]s.
	pub fn to_json(&self) -> Result<String, ProtocolError> {
		Ok(serde_json::to_string(self)?)
	}

	/// The typed view of this envelope.
	///
	/// # Errors
	///
	/// Iff the payload does not fit the shape its type demands.
	pub fn message(&self) -> Result<Message, ProtocolError> {
		let mut tagged = serde_json::Map::new();
		tagged.insert("type".to_owned(), Value::String(self.kind.as_str().to_owned()));
		if let Some(payload) = &self.payload {
			tagged.insert("payload".to_owned(), payload.clone());
		}
		serde_json::from_value(Value::Object(tagged)).map_err(|source| ProtocolError::Payload { kind: self.kind, source })
	}

	#[must_use]
	pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
		self.request_id = Some(request_id.into());
		self
	}
}

/// The typed message catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
	ElementSelected(ElementSelected),
	ElementDeselected,
	ContentUpdated(ValueChange),
	StyleUpdated(ValueChange),
	AddToChat(ElementSnapshot),
	CopyElement(ElementSnapshot),
	Heartbeat,
	BridgeReady,
	Acknowledgement(Acknowledgement),
	Error(ErrorPayload),
	ToggleDesignMode(ToggleDesignMode),
	UpdateStyle(UpdateStyle),
	UpdateContent(UpdateContent),
	BatchUpdate(BatchUpdate),
	GetElementState,
	ElementStateResponse(ElementState),
	HealthCheck,
	HealthCheckResponse(HealthCheckResponse),
}

impl Message {
	#[must_use]
	pub fn kind(&self) -> MessageType {
		match self {
			Message::ElementSelected(_) => MessageType::ElementSelected,
			Message::ElementDeselected => MessageType::ElementDeselected,
			Message::ContentUpdated(_) => MessageType::ContentUpdated,
			Message::StyleUpdated(_) => MessageType::StyleUpdated,
			Message::AddToChat(_) => MessageType::AddToChat,
			Message::CopyElement(_) => MessageType::CopyElement,
			Message::Heartbeat => MessageType::Heartbeat,
			Message::BridgeReady => MessageType::BridgeReady,
			Message::Acknowledgement(_) => MessageType::Acknowledgement,
			Message::Error(_) => MessageType::Error,
			Message::ToggleDesignMode(_) => MessageType::ToggleDesignMode,
			Message::UpdateStyle(_) => MessageType::UpdateStyle,
			Message::UpdateContent(_) => MessageType::UpdateContent,
			Message::BatchUpdate(_) => MessageType::BatchUpdate,
			Message::GetElementState => MessageType::GetElementState,
			Message::ElementStateResponse(_) => MessageType::ElementStateResponse,
			Message::HealthCheck => MessageType::HealthCheck,
			Message::HealthCheckResponse(_) => MessageType::HealthCheckResponse,
		}
	}

	/// An envelope without correlation data; the bridge fills that in on send.
	#[must_use]
	pub fn into_envelope(self) -> Envelope {
		let kind = self.kind();
		let payload = match serde_json::to_value(&self) {
			Ok(Value::Object(mut tagged)) => tagged.remove("payload"),
			_ => None,
		};
		Envelope {
			kind,
			payload,
			request_id: None,
			timestamp: None,
		}
	}
}

impl From<Message> for Envelope {
	fn from(message: Message) -> Self {
		message.into_envelope()
	}
}

/// What the host learns about a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
	pub tag_name: String,
	#[serde(default)]
	pub class_name: String,
	#[serde(default)]
	pub text_content: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_info: Option<SourceLocation>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub element_id: Option<String>,
	#[serde(default)]
	pub static_content: bool,
	#[serde(default)]
	pub static_class: bool,
	#[serde(default)]
	pub instance_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSelected {
	pub element_info: ElementInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChange {
	pub source_info: SourceLocation,
	pub old_value: String,
	pub new_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSnapshot {
	pub element: ElementInfo,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_info: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
	pub received: MessageType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
	pub code: ErrorCode,
	pub message: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_info: Option<SourceLocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	Validation,
	Persistence,
	Protocol,
	StaleCommand,
	NotSelected,
	Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleDesignMode {
	pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStyle {
	pub source_info: SourceLocation,
	pub new_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContent {
	pub source_info: SourceLocation,
	pub new_content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdate {
	pub updates: Vec<BatchItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
	#[serde(rename = "type")]
	pub kind: EditKind,
	pub source_info: SourceLocation,
	pub new_value: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub original_value: Option<String>,
}

/// The two kinds of edit the persistence collaborator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
	Style,
	Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementState {
	pub design_mode_enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub selected: Option<ElementInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Healthy,
	Degraded,
	Connecting,
	Unhealthy,
	/// A top-level page with nothing embedded needs no bridge.
	Unnecessary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResponse {
	pub status: HealthStatus,
	pub version: String,
	/// Milliseconds since the bridge was created.
	pub uptime: u64,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn wire_shape() {
		let envelope = Message::ToggleDesignMode(ToggleDesignMode { enabled: true }).into_envelope().with_request_id("r-1");
		assert_eq!(serde_json::to_value(&envelope).unwrap(), json!({"type": "TOGGLE_DESIGN_MODE", "payload": {"enabled": true}, "requestId": "r-1"}));
		assert_eq!(Message::Heartbeat.into_envelope().payload, None);
	}

	#[test]
	fn typed_view_of_batch() {
		let envelope = Envelope::parse(
			r#"{"type":"BATCH_UPDATE","payload":{"updates":[{"type":"style","sourceInfo":{"fileName":"src/A.tsx","lineNumber":1,"columnNumber":2},"newValue":"p-4"}]},"timestamp":5}"#,
		)
		.unwrap();
		assert_eq!(envelope.timestamp, Some(5));
		match envelope.message().unwrap() {
			Message::BatchUpdate(batch) => {
				assert_eq!(batch.updates.len(), 1);
				assert_eq!(batch.updates[0].kind, EditKind::Style);
				assert_eq!(batch.updates[0].original_value, None);
			}
			other => panic!("unexpected message {:?}", other),
		}
	}

	#[test]
	fn allow_list() {
		assert!(matches!(Envelope::parse(r#"{"type":"EVAL_SCRIPT","payload":"alert(1)"}"#), Err(ProtocolError::UnknownType(t)) if t == "EVAL_SCRIPT"));
		assert!(matches!(Envelope::parse(r#"{"payload":{}}"#), Err(ProtocolError::Untyped)));
		assert!(matches!(Envelope::parse("not json"), Err(ProtocolError::Json(_))));
		for kind in MessageType::ALL {
			assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
		}
	}

	#[test]
	fn malformed_payload_is_reported_on_typed_view() {
		let envelope = Envelope::parse(r#"{"type":"UPDATE_STYLE","payload":{"newClass":3}}"#).unwrap();
		assert!(matches!(envelope.message(), Err(ProtocolError::Payload { kind: MessageType::UpdateStyle, .. })));
	}
}
