#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use wayfarer_domain::{DELETED_MESSAGE_PLACEHOLDER, MessageId, MessageKind, ReportId, RoomId, UserId};

use crate::doc::{DocumentStore, Order, Query, StoreError, UpdateOp};

pub(crate) const MESSAGES: &str = "messages";
pub(crate) const REPORTS: &str = "reports";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionDoc {
	pub user_id: String,
	pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceiptDoc {
	pub user_id: String,
	pub at_unix_ms: i64,
}

/// Message document. Soft-deleted messages keep their id and row; only the
/// content is replaced and the flag set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDoc {
	pub room_id: String,
	pub sender_id: String,
	pub content: String,
	pub kind: MessageKind,
	pub created_at_unix_ms: i64,
	#[serde(default)]
	pub edited: bool,
	#[serde(default)]
	pub edited_at_unix_ms: i64,
	#[serde(default)]
	pub deleted: bool,
	#[serde(default)]
	pub deleted_at_unix_ms: i64,
	#[serde(default)]
	pub moderated: bool,
	#[serde(default)]
	pub moderated_by: String,
	#[serde(default)]
	pub moderation_reason: String,
	#[serde(default)]
	pub reactions: Vec<ReactionDoc>,
	#[serde(default)]
	pub reply_to: String,
	#[serde(default)]
	pub read_receipts: Vec<ReadReceiptDoc>,
	#[serde(default)]
	pub pinned: bool,
}

impl MessageDoc {
	pub fn new(
		room_id: &RoomId,
		sender_id: &UserId,
		content: impl Into<String>,
		kind: MessageKind,
		reply_to: Option<&MessageId>,
		created_at_unix_ms: i64,
	) -> Self {
		Self {
			room_id: room_id.as_str().to_string(),
			sender_id: sender_id.as_str().to_string(),
			content: content.into(),
			kind,
			created_at_unix_ms,
			edited: false,
			edited_at_unix_ms: 0,
			deleted: false,
			deleted_at_unix_ms: 0,
			moderated: false,
			moderated_by: String::new(),
			moderation_reason: String::new(),
			reactions: Vec::new(),
			reply_to: reply_to.map(|id| id.to_string()).unwrap_or_default(),
			read_receipts: Vec::new(),
			pinned: false,
		}
	}
}

/// Moderation report document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDoc {
	pub message_id: String,
	pub room_id: String,
	pub reporter_id: String,
	pub reason: String,
	#[serde(default)]
	pub description: String,
	pub created_at_unix_ms: i64,
}

/// Append-only per-room message storage.
#[derive(Clone)]
pub struct MessageLog {
	store: Arc<dyn DocumentStore>,
}

impl MessageLog {
	pub fn new(store: Arc<dyn DocumentStore>) -> Self {
		Self { store }
	}

	pub async fn append(&self, id: &MessageId, doc: &MessageDoc) -> Result<(), StoreError> {
		self.store.create(MESSAGES, &id.to_string(), serde_json::to_value(doc)?).await
	}

	pub async fn load(&self, id: &MessageId) -> Result<Option<MessageDoc>, StoreError> {
		let Some(doc) = self.store.get(MESSAGES, &id.to_string()).await? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_value(doc)?))
	}

	/// The newest `limit` non-deleted messages of a room, oldest first.
	pub async fn recent(&self, room: &RoomId, limit: usize) -> Result<Vec<(MessageId, MessageDoc)>, StoreError> {
		let hits = self
			.store
			.query(
				MESSAGES,
				Query::new()
					.filter_eq("room_id", json!(room.as_str()))
					.filter_eq("deleted", json!(false))
					.order_by("created_at_unix_ms", Order::Desc)
					.limit(limit),
			)
			.await?;

		let mut out = Vec::with_capacity(hits.len());
		for (id, doc) in hits {
			let Ok(message_id) = id.parse::<MessageId>() else { continue };
			out.push((message_id, serde_json::from_value(doc)?));
		}
		out.reverse();
		Ok(out)
	}

	/// Soft delete: replace the content with the fixed placeholder and set
	/// the flag. The document stays resolvable by id.
	pub async fn soft_delete(&self, id: &MessageId, at_unix_ms: i64) -> Result<(), StoreError> {
		self.store
			.update(
				MESSAGES,
				&id.to_string(),
				vec![
					UpdateOp::set("content", json!(DELETED_MESSAGE_PLACEHOLDER)),
					UpdateOp::set("deleted", json!(true)),
					UpdateOp::set("deleted_at_unix_ms", json!(at_unix_ms)),
				],
			)
			.await
	}

	pub async fn moderate(&self, id: &MessageId, moderator: &UserId, reason: &str) -> Result<(), StoreError> {
		self.store
			.update(
				MESSAGES,
				&id.to_string(),
				vec![
					UpdateOp::set("moderated", json!(true)),
					UpdateOp::set("moderated_by", json!(moderator.as_str())),
					UpdateOp::set("moderation_reason", json!(reason)),
				],
			)
			.await
	}

	pub async fn set_pinned(&self, id: &MessageId, pinned: bool) -> Result<(), StoreError> {
		self.store
			.update(MESSAGES, &id.to_string(), vec![UpdateOp::set("pinned", json!(pinned))])
			.await
	}

	/// Replace-or-insert the user's reaction in one atomic update: remove
	/// the previous reaction value (if any) and union the new one.
	pub async fn put_reaction(&self, id: &MessageId, user: &UserId, emoji: &str) -> Result<ReactionDoc, StoreError> {
		let previous = self
			.load(id)
			.await?
			.and_then(|doc| doc.reactions.into_iter().find(|r| r.user_id == user.as_str()));

		let reaction = ReactionDoc {
			user_id: user.as_str().to_string(),
			emoji: emoji.to_string(),
		};

		let mut ops = Vec::with_capacity(2);
		if let Some(prev) = previous {
			ops.push(UpdateOp::array_remove("reactions", serde_json::to_value(&prev)?));
		}
		ops.push(UpdateOp::array_union("reactions", serde_json::to_value(&reaction)?));

		self.store.update(MESSAGES, &id.to_string(), ops).await?;
		Ok(reaction)
	}

	pub async fn record_report(&self, id: &ReportId, doc: &ReportDoc) -> Result<(), StoreError> {
		self.store.create(REPORTS, &id.to_string(), serde_json::to_value(doc)?).await
	}
}
