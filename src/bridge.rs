//! The duplex channel between an embedded page and its host document.
//!
//! The bridge does no I/O of its own. Frames leave through a [`Transport`], arrive through [`Bridge::receive`], and
//! timers (handshake grace, heartbeats, staleness checks, request timeouts) advance only in [`Bridge::tick`]. The browser
//! backend drives both from `message` events and an interval; tests drive them by hand.
//!
//! # Handshake
//!
//! An [`Embedded`](`BridgeRole::Embedded`) bridge marks itself connected after a short grace delay and then announces
//! [`BRIDGE_READY`](`MessageType::BridgeReady`). Until then, outgoing messages are held for a bounded time and silently
//! dropped if the link never comes up. A [`TopLevel`](`BridgeRole::TopLevel`) bridge marks the link connected when it
//! hears from its counterpart and never fails a send when there is no counterpart at all.

use crate::{
	clock::Clock,
	config::{BridgeConfig, Config},
	protocol::{Acknowledgement, Envelope, HealthCheckResponse, HealthStatus, Message, MessageType, ProtocolError},
};
use core::time::Duration;
use futures::{
	channel::oneshot,
	future::{self, FutureExt, LocalBoxFuture},
};
use hashbrown::HashMap;
use std::{
	cell::RefCell,
	collections::VecDeque,
	rc::{Rc, Weak},
};
use tracing::{debug, info, instrument, trace, warn};
use web_time::Instant;

/// Which side of the channel this bridge is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeRole {
	/// The design-mode page, running inside a container document.
	Embedded,
	/// The container document, or a page that is not embedded at all.
	TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
	Disconnected,
	Connecting,
	Connected,
	/// Connected, but the counterpart stopped answering.
	Degraded,
}

impl LinkState {
	#[must_use]
	pub fn is_connected(self) -> bool {
		matches!(self, LinkState::Connected | LinkState::Degraded)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport failed: {0}")]
pub struct TransportError(pub String);

/// Carries frames to the counterpart.
pub trait Transport {
	/// # Errors
	///
	/// Iff the frame could not be handed to the counterpart.
	fn post(&self, envelope: &Envelope) -> Result<(), TransportError>;

	/// Whether there is anyone on the other end at all.
	fn has_counterpart(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
	#[error("no {expected} for request {request_id} within the timeout")]
	Timeout { request_id: String, expected: MessageType },
	#[error("the bridge was disconnected")]
	Disconnected,
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("counterpart reported an error: {0}")]
	Remote(String),
}

/// Result of [`Bridge::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
	pub status: HealthStatus,
	/// Present iff a round trip was made and answered.
	pub response: Option<HealthCheckResponse>,
}

type Handler = Rc<dyn Fn(&Envelope)>;

#[derive(Default)]
struct Subscribers {
	next_id: u64,
	by_type: HashMap<MessageType, Vec<(u64, Handler)>>,
}

/// Returned by [`Bridge::on`]. Dropping it keeps the handler subscribed.
#[derive(Debug, Clone)]
pub struct Subscription {
	subscribers: Weak<RefCell<Subscribers>>,
	kind: MessageType,
	id: u64,
}

impl Subscription {
	pub fn unsubscribe(self) {
		if let Some(subscribers) = self.subscribers.upgrade() {
			if let Some(handlers) = subscribers.borrow_mut().by_type.get_mut(&self.kind) {
				handlers.retain(|(id, _)| *id != self.id);
			}
		}
	}
}

struct PendingRequest {
	responder: oneshot::Sender<Result<Envelope, BridgeError>>,
	deadline: Instant,
	expected: MessageType,
}

struct BridgeState {
	link: LinkState,
	last_heard: Option<Instant>,
	pending: HashMap<String, PendingRequest>,
	outbox: VecDeque<(Envelope, Instant)>,
	ready_at: Option<Instant>,
	next_heartbeat: Option<Instant>,
	next_stale_check: Option<Instant>,
	failures: u32,
	next_request: u64,
	started_at: Instant,
	disposed: bool,
}

/// One end of the design-mode channel.
///
/// Construct it once per page, share it by [`Rc`], and tear it down with [`Bridge::disconnect`].
pub struct Bridge {
	role: BridgeRole,
	config: BridgeConfig,
	development: bool,
	transport: Rc<dyn Transport>,
	clock: Rc<dyn Clock>,
	state: Rc<RefCell<BridgeState>>,
	subscribers: Rc<RefCell<Subscribers>>,
}

impl core::fmt::Debug for Bridge {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let state = self.state.borrow();
		f.debug_struct("Bridge")
			.field("role", &self.role)
			.field("link", &state.link)
			.field("pending", &state.pending.len())
			.field("outbox", &state.outbox.len())
			.finish_non_exhaustive()
	}
}

impl Bridge {
	#[must_use]
	pub fn new(role: BridgeRole, config: &Config, transport: Rc<dyn Transport>, clock: Rc<dyn Clock>) -> Self {
		let now = clock.now();
		Self {
			role,
			config: config.bridge.clone(),
			development: config.development,
			transport,
			clock,
			state: Rc::new(RefCell::new(BridgeState {
				link: LinkState::Disconnected,
				last_heard: None,
				pending: HashMap::new(),
				outbox: VecDeque::new(),
				ready_at: None,
				next_heartbeat: None,
				next_stale_check: None,
				failures: 0,
				next_request: 0,
				started_at: now,
				disposed: false,
			})),
			subscribers: Rc::default(),
		}
	}

	#[must_use]
	pub fn role(&self) -> BridgeRole {
		self.role
	}

	#[must_use]
	pub fn link_state(&self) -> LinkState {
		self.state.borrow().link
	}

	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.link_state().is_connected()
	}

	#[must_use]
	pub fn last_heard(&self) -> Option<Instant> {
		self.state.borrow().last_heard
	}

	#[must_use]
	pub fn pending_requests(&self) -> usize {
		self.state.borrow().pending.len()
	}

	/// Begins the handshake.
	#[instrument(skip(self))]
	pub fn start(&self) {
		let now = self.clock.now();
		let mut state = self.state.borrow_mut();
		if state.disposed {
			return warn!("Ignoring `start` on a disconnected bridge.");
		}
		state.next_stale_check = Some(now + self.config.heartbeat_interval);
		match self.role {
			BridgeRole::Embedded => {
				state.link = LinkState::Connecting;
				state.ready_at = Some(now + self.config.ready_grace);
			}
			BridgeRole::TopLevel => {
				state.link = if self.transport.has_counterpart() { LinkState::Connecting } else { LinkState::Disconnected };
			}
		}
		debug!(link = ?state.link, "Bridge started.");
	}

	/// Tears the bridge down: pending requests fail, held messages and subscribers are dropped, timers stop.
	#[instrument(skip(self))]
	pub fn disconnect(&self) {
		let pending = {
			let mut state = self.state.borrow_mut();
			state.disposed = true;
			state.link = LinkState::Disconnected;
			state.outbox.clear();
			state.ready_at = None;
			state.next_heartbeat = None;
			state.next_stale_check = None;
			core::mem::take(&mut state.pending)
		};
		for (_, request) in pending {
			let _ = request.responder.send(Err(BridgeError::Disconnected));
		}
		self.subscribers.borrow_mut().by_type.clear();
		info!("Bridge disconnected.");
	}

	/// Subscribes `handler` to inbound messages of type `kind`.
	pub fn on(&self, kind: MessageType, handler: impl Fn(&Envelope) + 'static) -> Subscription {
		let mut subscribers = self.subscribers.borrow_mut();
		subscribers.next_id += 1;
		let id = subscribers.next_id;
		subscribers.by_type.entry(kind).or_default().push((id, Rc::new(handler)));
		Subscription { subscribers: Rc::downgrade(&self.subscribers), kind, id }
	}

	/// Same as [`Subscription::unsubscribe`].
	pub fn off(&self, subscription: Subscription) {
		subscription.unsubscribe();
	}

	fn next_request_id(&self) -> String {
		let mut state = self.state.borrow_mut();
		state.next_request += 1;
		let side = match self.role {
			BridgeRole::Embedded => "embedded",
			BridgeRole::TopLevel => "host",
		};
		format!("{}-{}", side, state.next_request)
	}

	fn stamp(&self, envelope: &mut Envelope) {
		if envelope.request_id.is_none() {
			envelope.request_id = Some(self.next_request_id());
		}
		if envelope.timestamp.is_none() {
			envelope.timestamp = Some(self.clock.unix_millis());
		}
	}

	/// Fire-and-forget. Returns the request id the message went out with.
	///
	/// # Errors
	///
	/// Only in a development configuration, iff the transport fails on a connected link.
	#[instrument(skip(self, message))]
	pub fn send(&self, message: impl Into<Envelope>) -> Result<String, BridgeError> {
		let mut envelope = message.into();
		self.stamp(&mut envelope);
		let request_id = envelope.request_id.clone().unwrap_or_default();
		self.dispatch_outbound(envelope)?;
		Ok(request_id)
	}

	fn dispatch_outbound(&self, envelope: Envelope) -> Result<(), BridgeError> {
		let link = self.state.borrow().link;
		if !link.is_connected() {
			match self.role {
				BridgeRole::Embedded => {
					let deadline = self.clock.now() + self.config.ready_wait;
					trace!(kind = %envelope.kind, "Holding message until the handshake completes.");
					self.state.borrow_mut().outbox.push_back((envelope, deadline));
					return Ok(());
				}
				BridgeRole::TopLevel if !self.transport.has_counterpart() => {
					trace!(kind = %envelope.kind, "No counterpart; dropping message.");
					return Ok(());
				}
				BridgeRole::TopLevel => (),
			}
		}
		self.post(&envelope, link)
	}

	fn post(&self, envelope: &Envelope, link: LinkState) -> Result<(), BridgeError> {
		match self.transport.post(envelope) {
			Ok(()) => Ok(()),
			Err(error) if link.is_connected() && self.development => Err(error.into()),
			Err(error) => {
				warn!(kind = %envelope.kind, %error, "Failed to post message.");
				Ok(())
			}
		}
	}

	/// Sends `message` and waits for a correlated `expected` message.
	///
	/// The message goes out immediately, not on first poll. The future fails on timeout, on a correlated
	/// [`ERROR`](`MessageType::Error`) or when the bridge is disconnected.
	#[instrument(skip(self, message))]
	pub fn send_with_response(&self, message: impl Into<Envelope>, expected: MessageType) -> LocalBoxFuture<'static, Result<Envelope, BridgeError>> {
		let mut envelope = message.into();
		self.stamp(&mut envelope);
		let request_id = envelope.request_id.clone().unwrap_or_default();
		let (responder, response) = oneshot::channel();
		{
			let mut state = self.state.borrow_mut();
			if state.disposed {
				return future::ready(Err(BridgeError::Disconnected)).boxed_local();
			}
			let deadline = self.clock.now() + self.config.request_timeout;
			state.pending.insert(request_id.clone(), PendingRequest { responder, deadline, expected });
		}
		if let Err(error) = self.dispatch_outbound(envelope) {
			self.state.borrow_mut().pending.remove(&request_id);
			return future::ready(Err(error)).boxed_local();
		}
		async move { response.await.unwrap_or(Err(BridgeError::Disconnected)) }.boxed_local()
	}

	/// Parses and handles one inbound frame. Rejected frames are logged and dropped.
	///
	/// # Errors
	///
	/// Iff the frame was rejected, so transports can count them.
	pub fn receive(&self, frame: &str) -> Result<(), ProtocolError> {
		match Envelope::parse(frame) {
			Ok(envelope) => {
				self.receive_envelope(envelope);
				Ok(())
			}
			Err(error) => {
				warn!(%error, "Rejected inbound message.");
				Err(error)
			}
		}
	}

	/// Handles one inbound message that already passed the allow-list.
	#[instrument(skip(self, envelope), fields(kind = %envelope.kind, request_id = ?envelope.request_id))]
	pub fn receive_envelope(&self, envelope: Envelope) {
		if self.state.borrow().disposed {
			return trace!("Dropping message received after disconnect.");
		}
		let now = self.clock.now();
		let (flush, responder) = {
			let mut state = self.state.borrow_mut();
			state.last_heard = Some(now);
			state.failures = 0;
			match (self.role, state.link) {
				(BridgeRole::TopLevel, LinkState::Connected) | (BridgeRole::Embedded, LinkState::Connecting | LinkState::Disconnected) => (),
				(BridgeRole::TopLevel, _) => {
					info!("Counterpart is up; link connected.");
					state.link = LinkState::Connected;
				}
				(BridgeRole::Embedded, LinkState::Degraded) => {
					info!("Counterpart answered again; link recovered.");
					state.link = LinkState::Connected;
				}
				(BridgeRole::Embedded, LinkState::Connected) => (),
			}
			let flush = if state.link.is_connected() { core::mem::take(&mut state.outbox) } else { VecDeque::new() };

			let correlated = envelope
				.request_id
				.as_ref()
				.and_then(|id| state.pending.get(id))
				.map_or(false, |request| request.expected == envelope.kind || envelope.kind == MessageType::Error);
			let responder = if correlated { envelope.request_id.as_ref().and_then(|id| state.pending.remove(id)) } else { None };
			(flush, responder)
		};
		self.flush(flush, now);

		if let Some(request) = responder {
			let result = if envelope.kind == MessageType::Error && request.expected != MessageType::Error {
				let detail = match envelope.message() {
					Ok(Message::Error(payload)) => payload.message,
					_ => "malformed error payload".to_owned(),
				};
				Err(BridgeError::Remote(detail))
			} else {
				Ok(envelope.clone())
			};
			let _ = request.responder.send(result);
			return;
		}

		match envelope.kind {
			MessageType::HealthCheck => self.answer_health_check(&envelope),
			kind if !kind.is_response() && !kind.is_answered_in_kind() => {
				if let Some(request_id) = &envelope.request_id {
					let ack = Message::Acknowledgement(Acknowledgement { received: kind }).into_envelope().with_request_id(request_id.clone());
					if let Err(error) = self.send(ack) {
						warn!(%error, "Failed to acknowledge message.");
					}
				}
			}
			_ => (),
		}

		let handlers: Vec<Handler> = match self.subscribers.borrow().by_type.get(&envelope.kind) {
			Some(handlers) => handlers.iter().map(|(_, handler)| handler.clone()).collect(),
			None => Vec::new(),
		};
		trace!("Dispatching to {} subscriber(s).", handlers.len());
		for handler in handlers {
			handler(&envelope);
		}
	}

	fn answer_health_check(&self, request: &Envelope) {
		let status = match self.link_state() {
			LinkState::Connected => HealthStatus::Healthy,
			LinkState::Degraded => HealthStatus::Degraded,
			LinkState::Connecting => HealthStatus::Connecting,
			LinkState::Disconnected => HealthStatus::Unhealthy,
		};
		let mut response = Message::HealthCheckResponse(self.health_payload(status)).into_envelope();
		response.request_id = request.request_id.clone();
		if let Err(error) = self.send(response) {
			warn!(%error, "Failed to answer health check.");
		}
	}

	#[allow(clippy::cast_possible_truncation)]
	fn health_payload(&self, status: HealthStatus) -> HealthCheckResponse {
		let uptime = self.clock.now().saturating_duration_since(self.state.borrow().started_at);
		HealthCheckResponse {
			status,
			version: env!("CARGO_PKG_VERSION").to_owned(),
			uptime: uptime.as_millis() as u64,
		}
	}

	fn flush(&self, outbox: VecDeque<(Envelope, Instant)>, now: Instant) {
		for (envelope, deadline) in outbox {
			if deadline < now {
				debug!(kind = %envelope.kind, "Dropping message that outlived the handshake wait.");
				continue;
			}
			if let Err(error) = self.post(&envelope, LinkState::Connected) {
				warn!(%error, "Failed to post held message.");
			}
		}
	}

	/// Advances every timer to the clock's current time.
	pub fn tick(&self) {
		let now = self.clock.now();
		if self.state.borrow().disposed {
			return;
		}
		self.complete_handshake(now);
		self.expire_outbox(now);
		self.expire_requests(now);
		self.heartbeat(now);
		self.check_staleness(now);
	}

	fn complete_handshake(&self, now: Instant) {
		let flush = {
			let mut state = self.state.borrow_mut();
			match state.ready_at {
				Some(ready_at) if ready_at <= now => {
					state.ready_at = None;
					state.link = LinkState::Connected;
					state.last_heard = Some(now);
					state.next_heartbeat = Some(now + self.config.heartbeat_interval);
					core::mem::take(&mut state.outbox)
				}
				_ => return,
			}
		};
		info!("Handshake grace elapsed; announcing readiness.");
		let mut ready = Message::BridgeReady.into_envelope();
		self.stamp(&mut ready);
		if let Err(error) = self.post(&ready, LinkState::Connecting) {
			warn!(%error, "Failed to announce readiness.");
		}
		self.flush(flush, now);
	}

	fn expire_outbox(&self, now: Instant) {
		let mut state = self.state.borrow_mut();
		let before = state.outbox.len();
		state.outbox.retain(|(_, deadline)| *deadline >= now);
		let dropped = before - state.outbox.len();
		if dropped > 0 {
			debug!("No handshake in time; silently dropped {} held message(s).", dropped);
		}
	}

	fn expire_requests(&self, now: Instant) {
		let expired: Vec<(String, PendingRequest)> = {
			let mut state = self.state.borrow_mut();
			let ids: Vec<String> = state.pending.iter().filter(|(_, r)| r.deadline <= now).map(|(id, _)| id.clone()).collect();
			let expired: Vec<_> = ids.into_iter().filter_map(|id| state.pending.remove(&id).map(|r| (id, r))).collect();
			if !expired.is_empty() && state.link.is_connected() {
				state.failures += 1;
				self.degrade_if_failing(&mut state);
			}
			expired
		};
		for (request_id, request) in expired {
			debug!(%request_id, expected = %request.expected, "Request timed out.");
			let _ = request.responder.send(Err(BridgeError::Timeout { request_id, expected: request.expected }));
		}
	}

	fn degrade_if_failing(&self, state: &mut BridgeState) {
		if state.link == LinkState::Connected && state.failures >= self.config.degraded_after_failures {
			warn!(failures = state.failures, "Counterpart unresponsive; link degraded.");
			state.link = LinkState::Degraded;
		}
	}

	fn heartbeat(&self, now: Instant) {
		if self.role != BridgeRole::Embedded {
			return;
		}
		{
			let mut state = self.state.borrow_mut();
			match state.next_heartbeat {
				Some(due) if due <= now && state.link.is_connected() => state.next_heartbeat = Some(now + self.config.heartbeat_interval),
				_ => return,
			}
		}
		trace!("Heartbeat.");
		if let Err(error) = self.send(Message::Heartbeat) {
			warn!(%error, "Failed to send heartbeat.");
		}
	}

	fn check_staleness(&self, now: Instant) {
		let reannounce = {
			let mut state = self.state.borrow_mut();
			match state.next_stale_check {
				Some(due) if due <= now => state.next_stale_check = Some(now + self.config.heartbeat_interval),
				_ => return,
			}
			if !state.link.is_connected() {
				return;
			}
			let silent_for = state.last_heard.map_or(Duration::MAX, |heard| now.saturating_duration_since(heard));
			if silent_for <= self.config.stale_after {
				return;
			}
			state.failures += 1;
			warn!(?silent_for, failures = state.failures, "Link is stale.");
			self.degrade_if_failing(&mut state);
			if self.role == BridgeRole::TopLevel && !self.transport.has_counterpart() {
				info!("Counterpart is gone; link disconnected.");
				state.link = LinkState::Disconnected;
			}
			self.role == BridgeRole::Embedded
		};
		if reannounce {
			let mut ready = Message::BridgeReady.into_envelope();
			self.stamp(&mut ready);
			if let Err(error) = self.post(&ready, LinkState::Connecting) {
				warn!(%error, "Failed to re-announce readiness.");
			}
		}
	}

	/// Reports link health.
	///
	/// A top-level bridge answers from its own state without any exchange, and reports
	/// [`Unnecessary`](`HealthStatus::Unnecessary`) when nothing is embedded. An embedded bridge makes a real round trip.
	#[instrument(skip(self))]
	pub fn health_check(&self) -> LocalBoxFuture<'static, HealthReport> {
		if self.role == BridgeRole::TopLevel {
			let status = if !self.transport.has_counterpart() {
				HealthStatus::Unnecessary
			} else {
				match self.link_state() {
					LinkState::Connected => HealthStatus::Healthy,
					LinkState::Degraded => HealthStatus::Degraded,
					LinkState::Connecting => HealthStatus::Connecting,
					LinkState::Disconnected => HealthStatus::Unhealthy,
				}
			};
			return future::ready(HealthReport { status, response: None }).boxed_local();
		}

		let state = Rc::clone(&self.state);
		let response = self.send_with_response(Message::HealthCheck, MessageType::HealthCheckResponse);
		async move {
			match response.await {
				Ok(envelope) => match envelope.message() {
					Ok(Message::HealthCheckResponse(response)) => HealthReport { status: HealthStatus::Healthy, response: Some(response) },
					_ => HealthReport { status: HealthStatus::Unhealthy, response: None },
				},
				Err(BridgeError::Timeout { .. }) => {
					let status = match state.borrow().link {
						LinkState::Connected | LinkState::Degraded => HealthStatus::Degraded,
						LinkState::Connecting => HealthStatus::Connecting,
						LinkState::Disconnected => HealthStatus::Unhealthy,
					};
					HealthReport { status, response: None }
				}
				Err(_) => HealthReport { status: HealthStatus::Unhealthy, response: None },
			}
		}
		.boxed_local()
	}
}
