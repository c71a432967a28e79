#![forbid(unsafe_code)]

//! Request handlers for authenticated sessions.
//!
//! Each handler validates, mutates the store through the atomic primitives,
//! and publishes the broadcasts the mutation implies. Acks are assembled by
//! the session loop from the returned result. Join-policy checks run in a
//! fixed order: ban, then capacity, then entitlement.

use std::collections::HashMap;

use tracing::{debug, warn};
use wayfarer_domain::{ChatError, MessageId, ReportId, RoomId, RoomRole, RoomType, UserId, codes};
use wayfarer_protocol::{convert, pb};
use wayfarer_services::{ActionKind, UserIdentity};
use wayfarer_store::{MemberMeta, MessageDoc, ReportDoc, RoomDoc};
use wayfarer_util::time::unix_ms_now;

use crate::server::deps::ChatDeps;

pub fn event_envelope(room: &RoomId, event: pb::event_envelope::Event) -> pb::EventEnvelope {
	pb::EventEnvelope {
		room_id: room.as_str().to_string(),
		server_time_unix_ms: unix_ms_now(),
		event: Some(event),
	}
}

pub fn identity_to_wire(user: &UserIdentity, online: bool) -> pb::User {
	pb::User {
		id: user.id.as_str().to_string(),
		display_name: user.display_name.clone(),
		role: convert::user_role_to_wire(user.role) as i32,
		online,
		last_seen_unix_ms: if online { unix_ms_now() } else { user.last_seen_unix_ms },
	}
}

pub fn room_to_wire(id: &RoomId, doc: &RoomDoc) -> pb::Room {
	pb::Room {
		id: id.as_str().to_string(),
		name: doc.name.clone(),
		room_type: convert::room_type_to_wire(doc.room_type) as i32,
		members: doc
			.member_ids
			.iter()
			.map(|uid| {
				let meta = doc.member_meta.get(uid);
				pb::RoomMember {
					user_id: uid.clone(),
					role: meta
						.map(|m| convert::room_role_to_wire(m.role) as i32)
						.unwrap_or(pb::RoomRole::Member as i32),
					joined_at_unix_ms: meta.map(|m| m.joined_at_unix_ms).unwrap_or_default(),
					last_read_unix_ms: meta.map(|m| m.last_read_unix_ms).unwrap_or_default(),
				}
			})
			.collect(),
		pinned_message_ids: doc.pinned_message_ids.clone(),
		max_members: doc.max_members,
		message_count: doc.message_count,
		last_activity_unix_ms: doc.last_activity_unix_ms,
	}
}

pub fn message_to_wire(id: &MessageId, doc: &MessageDoc, senders: &HashMap<String, pb::User>) -> pb::Message {
	let sender = senders.get(&doc.sender_id).cloned().unwrap_or(pb::User {
		id: doc.sender_id.clone(),
		display_name: doc.sender_id.clone(),
		role: pb::UserRole::User as i32,
		online: false,
		last_seen_unix_ms: 0,
	});

	pb::Message {
		id: id.to_string(),
		room_id: doc.room_id.clone(),
		sender: Some(sender),
		content: doc.content.clone(),
		kind: convert::message_kind_to_wire(doc.kind) as i32,
		created_at_unix_ms: doc.created_at_unix_ms,
		edited: doc.edited,
		edited_at_unix_ms: doc.edited_at_unix_ms,
		deleted: doc.deleted,
		deleted_at_unix_ms: doc.deleted_at_unix_ms,
		moderated: doc.moderated,
		moderated_by: doc.moderated_by.clone(),
		moderation_reason: doc.moderation_reason.clone(),
		reactions: doc
			.reactions
			.iter()
			.map(|r| pb::Reaction {
				user_id: r.user_id.clone(),
				emoji: r.emoji.clone(),
			})
			.collect(),
		reply_to: doc.reply_to.clone(),
		read_receipts: doc
			.read_receipts
			.iter()
			.map(|r| pb::ReadReceipt {
				user_id: r.user_id.clone(),
				at_unix_ms: r.at_unix_ms,
			})
			.collect(),
		pinned: doc.pinned,
	}
}

fn parse_room_id(s: &str) -> Result<RoomId, ChatError> {
	RoomId::new(s.trim()).map_err(|_| ChatError::validation("room id is required", codes::MISSING_FIELD))
}

fn parse_message_id(s: &str) -> Result<MessageId, ChatError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ChatError::validation("message id is required", codes::MISSING_FIELD));
	}
	s.parse::<MessageId>().map_err(|_| ChatError::not_found("message"))
}

/// Resolve display records for the distinct senders of a message window.
async fn sender_views(deps: &ChatDeps, docs: &[(MessageId, MessageDoc)]) -> HashMap<String, pb::User> {
	let mut senders = HashMap::new();
	for (_, doc) in docs {
		if senders.contains_key(&doc.sender_id) {
			continue;
		}
		let Ok(uid) = UserId::new(doc.sender_id.clone()) else { continue };
		match deps.presence.load_user(&uid).await {
			Ok(Some(rec)) => {
				senders.insert(
					doc.sender_id.clone(),
					pb::User {
						id: doc.sender_id.clone(),
						display_name: rec.display_name,
						role: convert::user_role_to_wire(rec.role) as i32,
						online: rec.online,
						last_seen_unix_ms: rec.last_seen_unix_ms,
					},
				);
			}
			Ok(None) => {}
			Err(e) => debug!(sender = %doc.sender_id, error = %e, "failed to resolve sender record"),
		}
	}
	senders
}

async fn load_room(deps: &ChatDeps, room: &RoomId) -> Result<RoomDoc, ChatError> {
	deps.rooms.load_room(room).await?.ok_or_else(|| ChatError::not_found("room"))
}

async fn load_message(deps: &ChatDeps, id: &MessageId) -> Result<MessageDoc, ChatError> {
	deps.messages.load(id).await?.ok_or_else(|| ChatError::not_found("message"))
}

fn require_moderator(room: &RoomDoc, user: &UserId) -> Result<RoomRole, ChatError> {
	match room.role_of(user) {
		Some(role) if role.can_moderate() => Ok(role),
		Some(_) => Err(ChatError::permission(
			"this action requires a moderator role",
			codes::PERMISSION_DENIED,
		)),
		None => Err(ChatError::permission("not a member of this room", codes::PERMISSION_DENIED)),
	}
}

fn require_admin(room: &RoomDoc, user: &UserId) -> Result<(), ChatError> {
	match room.role_of(user) {
		Some(RoomRole::Admin) => Ok(()),
		Some(_) => Err(ChatError::permission(
			"this action requires the room admin role",
			codes::PERMISSION_DENIED,
		)),
		None => Err(ChatError::permission("not a member of this room", codes::PERMISSION_DENIED)),
	}
}

fn require_member(room: &RoomDoc, user: &UserId) -> Result<(), ChatError> {
	if room.is_member(user) {
		Ok(())
	} else {
		Err(ChatError::permission("not a member of this room", codes::PERMISSION_DENIED))
	}
}

/// Join a room: ban check, capacity check, entitlement check, in that
/// order. Re-joining an already-joined room is a no-op success. The joining
/// session gets only the ack; everyone else gets `user_joined_room`.
pub async fn join_room(
	deps: &ChatDeps,
	conn_id: u64,
	user: &UserIdentity,
	req: &pb::JoinRoom,
) -> Result<pb::ack::Data, ChatError> {
	let room_id = parse_room_id(&req.room_id)?;
	let room = load_room(deps, &room_id).await?;

	if room.is_banned(&user.id) {
		return Err(ChatError::permission("you are banned from this room", codes::BANNED));
	}

	let now = unix_ms_now();
	let newly_joined = !room.is_member(&user.id);

	if newly_joined {
		if room.is_full() {
			return Err(ChatError::validation("room is at capacity", codes::ROOM_FULL));
		}

		if room.room_type == RoomType::Private {
			let entitled = deps
				.entitlement
				.can_access_private_rooms(&user.id)
				.await
				.map_err(|e| ChatError::Transport(format!("entitlement check failed: {e}")))?;
			if !entitled {
				return Err(ChatError::permission(
					"private rooms require an active subscription",
					codes::UPGRADE_REQUIRED,
				));
			}
		}

		deps.rooms
			.add_member(
				&room_id,
				&user.id,
				MemberMeta {
					role: RoomRole::Member,
					joined_at_unix_ms: now,
					last_read_unix_ms: now,
				},
				false,
			)
			.await?;
	} else {
		deps.rooms.touch_last_read(&room_id, &user.id, now).await?;
	}

	// Snapshot after the membership write so the joiner sees themselves.
	let room = load_room(deps, &room_id).await?;
	let recent = deps.messages.recent(&room_id, deps.chat.recent_message_limit).await?;
	let senders = sender_views(deps, &recent).await;
	let messages = recent
		.iter()
		.map(|(id, doc)| message_to_wire(id, doc, &senders))
		.collect();

	if newly_joined {
		deps.hub
			.publish(
				&room_id,
				event_envelope(
					&room_id,
					pb::event_envelope::Event::UserJoinedRoom(pb::UserJoinedRoomEvent {
						room_id: room_id.as_str().to_string(),
						user: Some(identity_to_wire(user, true)),
					}),
				),
				Some(conn_id),
			)
			.await;
		metrics::counter!("wayfarer_server_room_joins_total").increment(1);
	}

	Ok(pb::ack::Data::JoinRoom(pb::JoinRoomData {
		room: Some(room_to_wire(&room_id, &room)),
		messages,
	}))
}

/// Leave a room. Leaving a room you are not in (or that does not exist) is
/// a no-op success; the user's intent is already satisfied.
pub async fn leave_room(deps: &ChatDeps, conn_id: u64, user: &UserIdentity, req: &pb::LeaveRoom) -> Result<(), ChatError> {
	let room_id = parse_room_id(&req.room_id)?;
	let Some(room) = deps.rooms.load_room(&room_id).await? else {
		return Ok(());
	};

	if !room.is_member(&user.id) {
		return Ok(());
	}

	deps.rooms.remove_member(&room_id, &user.id).await?;
	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::UserLeftRoom(pb::UserLeftRoomEvent {
					room_id: room_id.as_str().to_string(),
					user: Some(identity_to_wire(user, true)),
				}),
			),
			Some(conn_id),
		)
		.await;
	metrics::counter!("wayfarer_server_room_leaves_total").increment(1);

	Ok(())
}

/// Append a message and fan it out to every subscribed session, including
/// the sender's other connections. Content is validated before any store
/// write.
pub async fn send_message(deps: &ChatDeps, user: &UserIdentity, req: &pb::SendMessage) -> Result<pb::ack::Data, ChatError> {
	let room_id = parse_room_id(&req.room_id)?;

	if req.content.trim().is_empty() {
		return Err(ChatError::validation("message content is empty", codes::EMPTY_CONTENT));
	}
	let chars = req.content.chars().count();
	if chars > deps.chat.max_message_chars {
		return Err(ChatError::validation(
			format!(
				"message content exceeds {} characters (got {chars})",
				deps.chat.max_message_chars
			),
			codes::CONTENT_TOO_LONG,
		));
	}

	let room = load_room(deps, &room_id).await?;
	require_member(&room, &user.id)?;

	let reply_to = req.reply_to.trim();
	let reply_ref = if reply_to.is_empty() {
		None
	} else {
		let reply_id = parse_message_id(reply_to)?;
		let target = load_message(deps, &reply_id).await?;
		if target.room_id != room_id.as_str() {
			return Err(ChatError::validation(
				"reply target is not in this room",
				codes::INVALID_REPLY,
			));
		}
		Some(reply_id)
	};

	let now = unix_ms_now();
	let id = MessageId::new_v4();
	let doc = MessageDoc::new(
		&room_id,
		&user.id,
		req.content.clone(),
		convert::message_kind_from_wire(req.kind),
		reply_ref.as_ref(),
		now,
	);

	deps.messages.append(&id, &doc).await?;
	deps.rooms.record_message_activity(&room_id, now).await?;

	let mut senders = HashMap::new();
	senders.insert(user.id.as_str().to_string(), identity_to_wire(user, true));
	let message = message_to_wire(&id, &doc, &senders);

	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::NewMessage(pb::NewMessageEvent {
					message: Some(message.clone()),
				}),
			),
			None,
		)
		.await;
	metrics::counter!("wayfarer_server_messages_total").increment(1);

	Ok(pb::ack::Data::SendMessage(pb::SendMessageData { message: Some(message) }))
}

/// Typing indicators: stateless, unacked, rate limited. Anything off-policy
/// is dropped silently — never erred back to the sender.
pub async fn typing(deps: &ChatDeps, conn_id: u64, user: &UserIdentity, room_id: &str, started: bool) {
	let Ok(room_id) = RoomId::new(room_id.trim()) else {
		return;
	};

	if !deps.state.read().await.is_subscribed(conn_id, &room_id) {
		return;
	}

	if !deps.limiter.allow(&user.id, ActionKind::Typing).await {
		metrics::counter!("wayfarer_server_typing_rate_limited_total").increment(1);
		return;
	}

	let event = if started {
		pb::event_envelope::Event::UserTyping(pb::UserTypingEvent {
			room_id: room_id.as_str().to_string(),
			user_id: user.id.as_str().to_string(),
		})
	} else {
		pb::event_envelope::Event::UserStoppedTyping(pb::UserStoppedTypingEvent {
			room_id: room_id.as_str().to_string(),
			user_id: user.id.as_str().to_string(),
		})
	};

	deps.hub.publish(&room_id, event_envelope(&room_id, event), Some(conn_id)).await;
}

/// Replace-or-insert the user's reaction. Fire-and-forget on the wire; the
/// session logs failures instead of acking them.
pub async fn add_reaction(deps: &ChatDeps, user: &UserIdentity, req: &pb::AddReaction) -> Result<(), ChatError> {
	let message_id = parse_message_id(&req.message_id)?;
	let emoji = req.emoji.trim();
	if emoji.is_empty() {
		return Err(ChatError::validation("emoji is required", codes::MISSING_FIELD));
	}

	let message = load_message(deps, &message_id).await?;
	let room_id = RoomId::new(message.room_id.clone()).map_err(|_| ChatError::not_found("room"))?;
	let room = load_room(deps, &room_id).await?;
	require_member(&room, &user.id)?;

	if !deps.limiter.allow(&user.id, ActionKind::Reaction).await {
		metrics::counter!("wayfarer_server_reactions_rate_limited_total").increment(1);
		return Ok(());
	}

	let reaction = deps.messages.put_reaction(&message_id, &user.id, emoji).await?;

	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::ReactionAdded(pb::ReactionAddedEvent {
					room_id: room_id.as_str().to_string(),
					message_id: message_id.to_string(),
					reaction: Some(pb::Reaction {
						user_id: reaction.user_id,
						emoji: reaction.emoji,
					}),
				}),
			),
			None,
		)
		.await;

	Ok(())
}

/// Page through rooms, most recently active first.
pub async fn get_rooms(deps: &ChatDeps, req: &pb::GetRooms) -> Result<pb::ack::Data, ChatError> {
	let room_type = convert::room_type_from_wire(req.room_type);
	let limit = if req.limit == 0 { 20 } else { req.limit };

	let page = deps.rooms.list_rooms(room_type, req.page, limit).await?;

	Ok(pb::ack::Data::Rooms(pb::RoomListData {
		rooms: page.rooms.iter().map(|(id, doc)| room_to_wire(id, doc)).collect(),
		pagination: Some(pb::Pagination {
			page: page.page,
			limit: page.limit,
			total: page.total,
			has_more: page.has_more(),
		}),
	}))
}

/// Soft delete. The sender may delete their own message; room moderators
/// and admins may delete any.
pub async fn delete_message(deps: &ChatDeps, user: &UserIdentity, req: &pb::DeleteMessage) -> Result<(), ChatError> {
	let message_id = parse_message_id(&req.message_id)?;
	let message = load_message(deps, &message_id).await?;
	let room_id = RoomId::new(message.room_id.clone()).map_err(|_| ChatError::not_found("room"))?;
	let room = load_room(deps, &room_id).await?;

	let own_message = message.sender_id == user.id.as_str();
	if !own_message {
		require_moderator(&room, &user.id)?;
	}

	deps.messages.soft_delete(&message_id, unix_ms_now()).await?;
	if message.pinned {
		deps.messages.set_pinned(&message_id, false).await?;
		deps.rooms.set_pinned(&room_id, &message_id.to_string(), false).await?;
	}

	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::MessageDeleted(pb::MessageDeletedEvent {
					room_id: room_id.as_str().to_string(),
					message_id: message_id.to_string(),
				}),
			),
			None,
		)
		.await;
	metrics::counter!("wayfarer_server_messages_deleted_total").increment(1);

	Ok(())
}

/// Flag a message as moderated. Moderator/admin only, independent of
/// message ownership.
pub async fn moderate_message(deps: &ChatDeps, user: &UserIdentity, req: &pb::ModerateMessage) -> Result<(), ChatError> {
	let message_id = parse_message_id(&req.message_id)?;
	let reason = req.reason.trim();
	if reason.is_empty() {
		return Err(ChatError::validation("moderation reason is required", codes::MISSING_FIELD));
	}

	let message = load_message(deps, &message_id).await?;
	let room_id = RoomId::new(message.room_id.clone()).map_err(|_| ChatError::not_found("room"))?;
	let room = load_room(deps, &room_id).await?;
	require_moderator(&room, &user.id)?;

	deps.messages.moderate(&message_id, &user.id, reason).await?;

	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::MessageModerated(pb::MessageModeratedEvent {
					room_id: room_id.as_str().to_string(),
					message_id: message_id.to_string(),
					moderated_by: user.id.as_str().to_string(),
					reason: reason.to_string(),
				}),
			),
			None,
		)
		.await;
	metrics::counter!("wayfarer_server_messages_moderated_total").increment(1);

	Ok(())
}

/// Flip a message's pin flag and the room's pinned set.
pub async fn toggle_pin_message(deps: &ChatDeps, user: &UserIdentity, req: &pb::TogglePinMessage) -> Result<(), ChatError> {
	let message_id = parse_message_id(&req.message_id)?;
	let message = load_message(deps, &message_id).await?;
	let room_id = RoomId::new(message.room_id.clone()).map_err(|_| ChatError::not_found("room"))?;
	let room = load_room(deps, &room_id).await?;
	require_moderator(&room, &user.id)?;

	let pinned = !message.pinned;
	deps.messages.set_pinned(&message_id, pinned).await?;
	deps.rooms.set_pinned(&room_id, &message_id.to_string(), pinned).await?;

	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::MessagePinToggled(pb::MessagePinToggledEvent {
					room_id: room_id.as_str().to_string(),
					message_id: message_id.to_string(),
					pinned,
				}),
			),
			None,
		)
		.await;

	Ok(())
}

/// File a report against a message. Any member of the message's room may
/// report; moderators consume the resulting feed.
pub async fn report_message(deps: &ChatDeps, user: &UserIdentity, req: &pb::ReportMessage) -> Result<(), ChatError> {
	let message_id = parse_message_id(&req.message_id)?;
	let reason = req.reason.trim();
	if reason.is_empty() {
		return Err(ChatError::validation("report reason is required", codes::MISSING_FIELD));
	}

	let message = load_message(deps, &message_id).await?;
	let room_id = RoomId::new(message.room_id.clone()).map_err(|_| ChatError::not_found("room"))?;
	let room = load_room(deps, &room_id).await?;
	require_member(&room, &user.id)?;

	let report_id = ReportId::new_v4();
	let report = ReportDoc {
		message_id: message_id.to_string(),
		room_id: room_id.as_str().to_string(),
		reporter_id: user.id.as_str().to_string(),
		reason: reason.to_string(),
		description: req.description.trim().to_string(),
		created_at_unix_ms: unix_ms_now(),
	};
	deps.messages.record_report(&report_id, &report).await?;

	deps.hub
		.publish(
			&room_id,
			event_envelope(
				&room_id,
				pb::event_envelope::Event::NewReport(pb::NewReportEvent {
					report: Some(pb::Report {
						id: report_id.to_string(),
						message_id: report.message_id,
						room_id: report.room_id,
						reporter_id: report.reporter_id,
						reason: report.reason,
						description: report.description,
						created_at_unix_ms: report.created_at_unix_ms,
					}),
				}),
			),
			None,
		)
		.await;
	metrics::counter!("wayfarer_server_reports_total").increment(1);

	Ok(())
}

/// Ban a user from a room. Room-admin only. The ban-list add and member
/// removal land in one atomic store update; live fan-out to the target is
/// cut immediately.
pub async fn ban_user(deps: &ChatDeps, user: &UserIdentity, req: &pb::BanUser) -> Result<(), ChatError> {
	let room_id = parse_room_id(&req.room_id)?;
	let target =
		UserId::new(req.user_id.trim()).map_err(|_| ChatError::validation("user id is required", codes::MISSING_FIELD))?;

	let room = load_room(deps, &room_id).await?;
	require_admin(&room, &user.id)?;

	if target == user.id {
		return Err(ChatError::Conflict("cannot ban yourself".to_string()));
	}

	let was_member = room.is_member(&target);
	deps.rooms.ban_user(&room_id, &target).await?;

	let target_conns = {
		let mut state = deps.state.write().await;
		let conns = state.conns_for_user(&target);
		for conn in &conns {
			state.unsubscribe(*conn, &room_id);
		}
		conns
	};
	for conn in target_conns {
		deps.hub.unsubscribe(&room_id, conn).await;
	}

	if was_member {
		let target_view = match deps.presence.load_user(&target).await {
			Ok(Some(rec)) => pb::User {
				id: target.as_str().to_string(),
				display_name: rec.display_name,
				role: convert::user_role_to_wire(rec.role) as i32,
				online: rec.online,
				last_seen_unix_ms: rec.last_seen_unix_ms,
			},
			_ => pb::User {
				id: target.as_str().to_string(),
				display_name: target.as_str().to_string(),
				role: pb::UserRole::User as i32,
				online: false,
				last_seen_unix_ms: 0,
			},
		};

		deps.hub
			.publish(
				&room_id,
				event_envelope(
					&room_id,
					pb::event_envelope::Event::UserLeftRoom(pb::UserLeftRoomEvent {
						room_id: room_id.as_str().to_string(),
						user: Some(target_view),
					}),
				),
				None,
			)
			.await;
	}

	warn!(room = %room_id, target = %target, by = %user.id, "user banned from room");
	metrics::counter!("wayfarer_server_bans_total").increment(1);

	Ok(())
}

/// Lift a ban. Room-admin only.
pub async fn unban_user(deps: &ChatDeps, user: &UserIdentity, req: &pb::UnbanUser) -> Result<(), ChatError> {
	let room_id = parse_room_id(&req.room_id)?;
	let target =
		UserId::new(req.user_id.trim()).map_err(|_| ChatError::validation("user id is required", codes::MISSING_FIELD))?;

	let room = load_room(deps, &room_id).await?;
	require_admin(&room, &user.id)?;

	deps.rooms.unban_user(&room_id, &target).await?;
	Ok(())
}

/// Promote or demote a member between member and moderator. Room-admin
/// only; the admin role itself is never granted over the wire.
pub async fn set_member_role(deps: &ChatDeps, user: &UserIdentity, req: &pb::SetMemberRole) -> Result<(), ChatError> {
	let room_id = parse_room_id(&req.room_id)?;
	let target =
		UserId::new(req.user_id.trim()).map_err(|_| ChatError::validation("user id is required", codes::MISSING_FIELD))?;
	let role = convert::room_role_from_wire(req.role)
		.ok_or_else(|| ChatError::validation("role is required", codes::MISSING_FIELD))?;

	if role == RoomRole::Admin {
		return Err(ChatError::permission(
			"the admin role cannot be granted here",
			codes::PERMISSION_DENIED,
		));
	}

	let room = load_room(deps, &room_id).await?;
	require_admin(&room, &user.id)?;

	if !room.is_member(&target) {
		return Err(ChatError::not_found("room member"));
	}

	deps.rooms.set_member_role(&room_id, &target, role).await?;
	Ok(())
}
