#![forbid(unsafe_code)]

//! Typed event subscriptions with explicit handles.
//!
//! Callbacks are registered per event kind and unsubscribed by handle, so
//! one caller can remove its own callback without touching handlers other
//! callers registered for the same event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wayfarer_protocol::pb;

/// Discriminant for [`ChatEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	NewMessage,
	UserJoined,
	UserLeft,
	Typing,
	StoppedTyping,
	StatusChange,
	ReactionAdded,
	MessageDeleted,
	MessageModerated,
	MessagePinToggled,
	NewReport,

	Connected,
	Reconnecting,
	ConnectionLost,
	Disconnected,
}

/// Events delivered to application subscribers: server broadcasts plus
/// connection lifecycle changes.
#[derive(Debug, Clone)]
pub enum ChatEvent {
	NewMessage(pb::Message),
	UserJoined { room_id: String, user: pb::User },
	UserLeft { room_id: String, user: pb::User },
	Typing { room_id: String, user_id: String },
	StoppedTyping { room_id: String, user_id: String },
	StatusChange(pb::User),
	ReactionAdded { room_id: String, message_id: String, reaction: pb::Reaction },
	MessageDeleted { room_id: String, message_id: String },
	MessageModerated { room_id: String, message_id: String, moderated_by: String, reason: String },
	MessagePinToggled { room_id: String, message_id: String, pinned: bool },
	NewReport(pb::Report),

	Connected { server_name: String },
	Reconnecting { attempt: u32, next_retry_in_ms: u64 },
	ConnectionLost { attempts: u32 },
	Disconnected { reason: String },
}

impl ChatEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			ChatEvent::NewMessage(_) => EventKind::NewMessage,
			ChatEvent::UserJoined { .. } => EventKind::UserJoined,
			ChatEvent::UserLeft { .. } => EventKind::UserLeft,
			ChatEvent::Typing { .. } => EventKind::Typing,
			ChatEvent::StoppedTyping { .. } => EventKind::StoppedTyping,
			ChatEvent::StatusChange(_) => EventKind::StatusChange,
			ChatEvent::ReactionAdded { .. } => EventKind::ReactionAdded,
			ChatEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
			ChatEvent::MessageModerated { .. } => EventKind::MessageModerated,
			ChatEvent::MessagePinToggled { .. } => EventKind::MessagePinToggled,
			ChatEvent::NewReport(_) => EventKind::NewReport,
			ChatEvent::Connected { .. } => EventKind::Connected,
			ChatEvent::Reconnecting { .. } => EventKind::Reconnecting,
			ChatEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
			ChatEvent::Disconnected { .. } => EventKind::Disconnected,
		}
	}

	/// Map a wire broadcast to its typed event.
	pub fn from_envelope(env: pb::EventEnvelope) -> Option<ChatEvent> {
		match env.event? {
			pb::event_envelope::Event::NewMessage(e) => e.message.map(ChatEvent::NewMessage),
			pb::event_envelope::Event::UserJoinedRoom(e) => e.user.map(|user| ChatEvent::UserJoined {
				room_id: e.room_id,
				user,
			}),
			pb::event_envelope::Event::UserLeftRoom(e) => e.user.map(|user| ChatEvent::UserLeft {
				room_id: e.room_id,
				user,
			}),
			pb::event_envelope::Event::UserTyping(e) => Some(ChatEvent::Typing {
				room_id: e.room_id,
				user_id: e.user_id,
			}),
			pb::event_envelope::Event::UserStoppedTyping(e) => Some(ChatEvent::StoppedTyping {
				room_id: e.room_id,
				user_id: e.user_id,
			}),
			pb::event_envelope::Event::UserStatusChange(e) => e.user.map(ChatEvent::StatusChange),
			pb::event_envelope::Event::ReactionAdded(e) => e.reaction.map(|reaction| ChatEvent::ReactionAdded {
				room_id: e.room_id,
				message_id: e.message_id,
				reaction,
			}),
			pb::event_envelope::Event::MessageDeleted(e) => Some(ChatEvent::MessageDeleted {
				room_id: e.room_id,
				message_id: e.message_id,
			}),
			pb::event_envelope::Event::MessageModerated(e) => Some(ChatEvent::MessageModerated {
				room_id: e.room_id,
				message_id: e.message_id,
				moderated_by: e.moderated_by,
				reason: e.reason,
			}),
			pb::event_envelope::Event::MessagePinToggled(e) => Some(ChatEvent::MessagePinToggled {
				room_id: e.room_id,
				message_id: e.message_id,
				pinned: e.pinned,
			}),
			pb::event_envelope::Event::NewReport(e) => e.report.map(ChatEvent::NewReport),
		}
	}
}

pub type EventCallback = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

/// Proof of a registration; required to unsubscribe precisely.
#[derive(Debug)]
pub struct SubscriptionHandle {
	kind: EventKind,
	id: u64,
}

/// Callback registry shared between the client handle and the driver.
#[derive(Default)]
pub struct Subscriptions {
	inner: Mutex<HashMap<EventKind, Vec<(u64, EventCallback)>>>,
	next_id: AtomicU64,
}

impl Subscriptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionHandle {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
		let mut inner = self.inner.lock().expect("subscriptions lock");
		inner.entry(kind).or_default().push((id, callback));
		SubscriptionHandle { kind, id }
	}

	/// Remove exactly the callback the handle was issued for.
	pub fn unsubscribe(&self, handle: SubscriptionHandle) {
		let mut inner = self.inner.lock().expect("subscriptions lock");
		if let Some(entries) = inner.get_mut(&handle.kind) {
			entries.retain(|(id, _)| *id != handle.id);
			if entries.is_empty() {
				inner.remove(&handle.kind);
			}
		}
	}

	/// Remove every callback registered for one event kind.
	pub fn clear(&self, kind: EventKind) {
		self.inner.lock().expect("subscriptions lock").remove(&kind);
	}

	/// Remove every callback for every event.
	pub fn clear_all(&self) {
		self.inner.lock().expect("subscriptions lock").clear();
	}

	pub fn dispatch(&self, event: &ChatEvent) {
		let callbacks: Vec<EventCallback> = {
			let inner = self.inner.lock().expect("subscriptions lock");
			inner
				.get(&event.kind())
				.map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
				.unwrap_or_default()
		};

		for cb in callbacks {
			cb(event);
		}
	}
}
