#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use wayfarer_domain::{RoomId, RoomRole, RoomType, UserId};

use crate::doc::{DocumentStore, Order, Query, StoreError, UpdateOp};

pub(crate) const ROOMS: &str = "rooms";

/// Per-member bookkeeping stored under `member_meta.<user_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberMeta {
	pub role: RoomRole,
	pub joined_at_unix_ms: i64,
	pub last_read_unix_ms: i64,
}

/// Room document.
///
/// `member_ids`, `banned_ids` and `pinned_message_ids` are only mutated via
/// array-union/array-remove; `message_count` only via atomic increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDoc {
	pub name: String,
	pub room_type: RoomType,
	#[serde(default)]
	pub member_ids: Vec<String>,
	#[serde(default)]
	pub member_meta: BTreeMap<String, MemberMeta>,
	#[serde(default)]
	pub banned_ids: Vec<String>,
	#[serde(default)]
	pub pinned_message_ids: Vec<String>,
	pub max_members: u32,
	#[serde(default)]
	pub message_count: u64,
	pub last_activity_unix_ms: i64,
	pub created_at_unix_ms: i64,
}

impl RoomDoc {
	pub fn new(name: impl Into<String>, room_type: RoomType, max_members: u32, now_unix_ms: i64) -> Self {
		Self {
			name: name.into(),
			room_type,
			member_ids: Vec::new(),
			member_meta: BTreeMap::new(),
			banned_ids: Vec::new(),
			pinned_message_ids: Vec::new(),
			max_members,
			message_count: 0,
			last_activity_unix_ms: now_unix_ms,
			created_at_unix_ms: now_unix_ms,
		}
	}

	pub fn member_count(&self) -> usize {
		self.member_ids.len()
	}

	pub fn is_member(&self, user: &UserId) -> bool {
		self.member_ids.iter().any(|m| m == user.as_str())
	}

	pub fn is_banned(&self, user: &UserId) -> bool {
		self.banned_ids.iter().any(|b| b == user.as_str())
	}

	pub fn is_full(&self) -> bool {
		self.member_count() >= self.max_members as usize
	}

	pub fn role_of(&self, user: &UserId) -> Option<RoomRole> {
		self.member_meta.get(user.as_str()).map(|m| m.role)
	}
}

/// One page of the room listing.
#[derive(Debug, Clone)]
pub struct RoomPage {
	pub rooms: Vec<(RoomId, RoomDoc)>,
	pub page: u32,
	pub limit: u32,
	pub total: u64,
}

impl RoomPage {
	pub fn has_more(&self) -> bool {
		let seen = (self.page as u64).saturating_mul(self.limit as u64) + self.rooms.len() as u64;
		seen < self.total
	}
}

/// Room membership, bans, roles and activity metadata.
///
/// Mechanical mutations only: join-policy ordering (ban, capacity,
/// entitlement) is enforced by the session layer before calling in here.
#[derive(Clone)]
pub struct RoomRegistry {
	store: Arc<dyn DocumentStore>,
}

impl RoomRegistry {
	pub fn new(store: Arc<dyn DocumentStore>) -> Self {
		Self { store }
	}

	pub async fn create_room(&self, id: &RoomId, doc: &RoomDoc) -> Result<(), StoreError> {
		self.store.create(ROOMS, id.as_str(), serde_json::to_value(doc)?).await
	}

	pub async fn load_room(&self, id: &RoomId) -> Result<Option<RoomDoc>, StoreError> {
		let Some(doc) = self.store.get(ROOMS, id.as_str()).await? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_value(doc)?))
	}

	/// Add (or re-confirm) a member. Idempotent: the union of an existing id
	/// is a no-op, and re-joining does not clobber existing meta.
	pub async fn add_member(&self, room: &RoomId, user: &UserId, meta: MemberMeta, overwrite_meta: bool) -> Result<(), StoreError> {
		let mut ops = vec![UpdateOp::array_union("member_ids", json!(user.as_str()))];
		let meta_field = member_meta_field(user);
		if overwrite_meta {
			ops.push(UpdateOp::set(meta_field, serde_json::to_value(&meta)?));
		} else {
			// Only write meta when absent so rejoin keeps the original
			// join timestamp and any promoted role.
			let existing = self
				.load_room(room)
				.await?
				.map(|doc| doc.member_meta.contains_key(user.as_str()))
				.unwrap_or(false);
			if !existing {
				ops.push(UpdateOp::set(meta_field, serde_json::to_value(&meta)?));
			}
		}
		self.store.update(ROOMS, room.as_str(), ops).await
	}

	pub async fn remove_member(&self, room: &RoomId, user: &UserId) -> Result<(), StoreError> {
		self.store
			.update(
				ROOMS,
				room.as_str(),
				vec![
					UpdateOp::array_remove("member_ids", json!(user.as_str())),
					UpdateOp::delete(member_meta_field(user)),
				],
			)
			.await
	}

	/// Ban atomically: the same update adds to the ban list and removes the
	/// membership, so no intermediate state violates member ∩ banned = ∅.
	pub async fn ban_user(&self, room: &RoomId, user: &UserId) -> Result<(), StoreError> {
		self.store
			.update(
				ROOMS,
				room.as_str(),
				vec![
					UpdateOp::array_union("banned_ids", json!(user.as_str())),
					UpdateOp::array_remove("member_ids", json!(user.as_str())),
					UpdateOp::delete(member_meta_field(user)),
				],
			)
			.await
	}

	pub async fn unban_user(&self, room: &RoomId, user: &UserId) -> Result<(), StoreError> {
		self.store
			.update(
				ROOMS,
				room.as_str(),
				vec![UpdateOp::array_remove("banned_ids", json!(user.as_str()))],
			)
			.await
	}

	pub async fn set_member_role(&self, room: &RoomId, user: &UserId, role: RoomRole) -> Result<(), StoreError> {
		self.store
			.update(
				ROOMS,
				room.as_str(),
				vec![UpdateOp::set(
					format!("{}.role", member_meta_field(user)),
					json!(role.as_str()),
				)],
			)
			.await
	}

	pub async fn touch_last_read(&self, room: &RoomId, user: &UserId, at_unix_ms: i64) -> Result<(), StoreError> {
		self.store
			.update(
				ROOMS,
				room.as_str(),
				vec![UpdateOp::set(
					format!("{}.last_read_unix_ms", member_meta_field(user)),
					json!(at_unix_ms),
				)],
			)
			.await
	}

	/// Message-counter bump + activity stamp, one atomic update. The counter
	/// stays monotonic under concurrent senders because the increment is a
	/// store-side op, not a read-modify-write.
	pub async fn record_message_activity(&self, room: &RoomId, at_unix_ms: i64) -> Result<(), StoreError> {
		self.store
			.update(
				ROOMS,
				room.as_str(),
				vec![
					UpdateOp::increment("message_count", 1),
					UpdateOp::set("last_activity_unix_ms", json!(at_unix_ms)),
				],
			)
			.await
	}

	pub async fn set_pinned(&self, room: &RoomId, message_id: &str, pinned: bool) -> Result<(), StoreError> {
		let op = if pinned {
			UpdateOp::array_union("pinned_message_ids", json!(message_id))
		} else {
			UpdateOp::array_remove("pinned_message_ids", json!(message_id))
		};
		self.store.update(ROOMS, room.as_str(), vec![op]).await
	}

	/// Rooms the user belongs to (presence fan-out targets).
	pub async fn rooms_for_member(&self, user: &UserId) -> Result<Vec<(RoomId, RoomDoc)>, StoreError> {
		let hits = self
			.store
			.query(
				ROOMS,
				Query::new().filter_array_contains("member_ids", json!(user.as_str())),
			)
			.await?;
		decode_room_hits(hits)
	}

	/// Page through rooms, most recently active first.
	pub async fn list_rooms(&self, room_type: Option<RoomType>, page: u32, limit: u32) -> Result<RoomPage, StoreError> {
		let limit = limit.clamp(1, 100);
		let mut query = Query::new()
			.order_by("last_activity_unix_ms", Order::Desc)
			.offset(page as usize * limit as usize)
			.limit(limit as usize);
		if let Some(t) = room_type {
			query = query.filter_eq("room_type", json!(t.as_str()));
		}

		let mut count_query = Query::new();
		if let Some(t) = room_type {
			count_query = count_query.filter_eq("room_type", json!(t.as_str()));
		}

		let total = self.store.count(ROOMS, count_query).await? as u64;
		let rooms = decode_room_hits(self.store.query(ROOMS, query).await?)?;

		Ok(RoomPage {
			rooms,
			page,
			limit,
			total,
		})
	}
}

fn member_meta_field(user: &UserId) -> String {
	format!("member_meta.{}", user.as_str())
}

fn decode_room_hits(hits: Vec<(String, Value)>) -> Result<Vec<(RoomId, RoomDoc)>, StoreError> {
	let mut out = Vec::with_capacity(hits.len());
	for (id, doc) in hits {
		// Ids in the store are non-empty by construction.
		let Ok(room_id) = RoomId::new(id) else { continue };
		out.push((room_id, serde_json::from_value(doc)?));
	}
	Ok(out)
}
