#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use wayfarer_domain::{RoomId, RoomRole, RoomType, UserId, UserRole};
use wayfarer_protocol::pb;
use wayfarer_services::{HmacIdentityProvider, SecretString, TierEntitlementProvider, UserIdentity};
use wayfarer_store::{DocumentStore, MemStore, MemberMeta, PresenceStore, RoomDoc, UserRecord};

use crate::config::ChatSettings;
use crate::server::deps::ChatDeps;
use crate::server::ops;
use crate::server::room_hub::RoomHubItem;

fn rid(s: &str) -> RoomId {
	RoomId::new(s).expect("valid room id")
}

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

fn ident(id: &str, name: &str) -> UserIdentity {
	UserIdentity {
		id: uid(id),
		display_name: name.to_string(),
		role: UserRole::User,
		last_seen_unix_ms: 0,
	}
}

fn meta(role: RoomRole) -> MemberMeta {
	MemberMeta {
		role,
		joined_at_unix_ms: 1,
		last_read_unix_ms: 1,
	}
}

struct Fixture {
	deps: Arc<ChatDeps>,
	store: Arc<MemStore>,
}

/// Seeds users ana (room admin of `general`), ben and mia, a public room
/// `general` (capacity 3) with ana as member/admin, and a private room
/// `premium-lounge`.
async fn fixture() -> Fixture {
	let store = MemStore::shared();
	let doc_store: Arc<dyn DocumentStore> = Arc::clone(&store) as Arc<dyn DocumentStore>;

	let presence = PresenceStore::new(Arc::clone(&doc_store));
	for (id, name) in [("ana", "Ana"), ("ben", "Ben"), ("mia", "Mia")] {
		presence
			.insert_user_record(
				&uid(id),
				&UserRecord {
					display_name: name.to_string(),
					role: UserRole::User,
					active: true,
					online: false,
					last_seen_unix_ms: 0,
				},
			)
			.await
			.unwrap();
	}

	let identity = HmacIdentityProvider::new(SecretString::new("test-secret"), presence);
	let entitlement = TierEntitlementProvider::new(Arc::clone(&doc_store));

	let mut chat = ChatSettings::default();
	chat.typing_rate_burst = 2;
	chat.typing_rate_per_minute = 1;

	let deps = ChatDeps::new(Arc::clone(&doc_store), identity, entitlement, chat);

	let mut general = RoomDoc::new("General", RoomType::Public, 3, 1);
	general.member_ids.push("ana".to_string());
	general.member_meta.insert("ana".to_string(), meta(RoomRole::Admin));
	deps.rooms.create_room(&rid("general"), &general).await.unwrap();

	deps.rooms
		.create_room(&rid("premium-lounge"), &RoomDoc::new("Premium Lounge", RoomType::Private, 16, 1))
		.await
		.unwrap();

	Fixture { deps, store }
}

async fn recv_event(rx: &mut tokio::sync::mpsc::Receiver<RoomHubItem>) -> pb::EventEnvelope {
	match timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected an event within the timeout")
		.expect("channel open")
	{
		RoomHubItem::Event(env) => *env,
		other => panic!("expected Event, got {other:?}"),
	}
}

async fn assert_silent(rx: &mut tokio::sync::mpsc::Receiver<RoomHubItem>) {
	assert!(
		timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
		"expected no event"
	);
}

async fn join(deps: &Arc<ChatDeps>, conn: u64, user: &UserIdentity, room: &str) -> Result<pb::ack::Data, wayfarer_domain::ChatError> {
	ops::join_room(
		deps,
		conn,
		user,
		&pb::JoinRoom {
			room_id: room.to_string(),
		},
	)
	.await
}

fn send_req(room: &str, content: &str) -> pb::SendMessage {
	pb::SendMessage {
		room_id: room.to_string(),
		content: content.to_string(),
		kind: pb::MessageKind::Text as i32,
		reply_to: String::new(),
	}
}

#[tokio::test]
async fn banned_users_are_rejected_before_any_other_check() {
	let Fixture { deps, .. } = fixture().await;
	let ben = ident("ben", "Ben");

	deps.rooms.ban_user(&rid("general"), &ben.id).await.unwrap();

	let err = join(&deps, 1, &ben, "general").await.unwrap_err();
	assert_eq!(err.code(), Some("banned"));

	let room = deps.rooms.load_room(&rid("general")).await.unwrap().unwrap();
	assert!(!room.is_member(&ben.id));
}

#[tokio::test]
async fn full_room_rejects_with_capacity_error() {
	let Fixture { deps, .. } = fixture().await;

	join(&deps, 1, &ident("ben", "Ben"), "general").await.unwrap();
	join(&deps, 2, &ident("mia", "Mia"), "general").await.unwrap();

	// Capacity 3, ana + ben + mia are in: the fourth join must fail.
	deps.presence
		.insert_user_record(
			&uid("leo"),
			&UserRecord {
				display_name: "Leo".to_string(),
				role: UserRole::User,
				active: true,
				online: false,
				last_seen_unix_ms: 0,
			},
		)
		.await
		.unwrap();

	let err = join(&deps, 3, &ident("leo", "Leo"), "general").await.unwrap_err();
	assert_eq!(err.code(), Some("roomFull"));
}

#[tokio::test]
async fn private_rooms_require_entitlement() {
	let Fixture { deps, store } = fixture().await;
	let ben = ident("ben", "Ben");

	let err = join(&deps, 1, &ben, "premium-lounge").await.unwrap_err();
	assert_eq!(err.code(), Some("upgradeRequired"));

	let entitlement = TierEntitlementProvider::new(Arc::clone(&store) as Arc<dyn DocumentStore>);
	entitlement.set_tier(&ben.id, "globetrotter").await.unwrap();

	join(&deps, 1, &ben, "premium-lounge").await.unwrap();
	let room = deps.rooms.load_room(&rid("premium-lounge")).await.unwrap().unwrap();
	assert!(room.is_member(&ben.id));
}

#[tokio::test]
async fn rejoin_is_a_noop_success() {
	let Fixture { deps, .. } = fixture().await;
	let ben = ident("ben", "Ben");

	join(&deps, 1, &ben, "general").await.unwrap();
	join(&deps, 1, &ben, "general").await.unwrap();

	let room = deps.rooms.load_room(&rid("general")).await.unwrap().unwrap();
	assert_eq!(room.member_ids.iter().filter(|m| *m == "ben").count(), 1);
}

#[tokio::test]
async fn join_ack_carries_snapshot_and_broadcast_skips_the_joiner() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");
	let room = rid("general");

	// ana's session (conn 1) and ben's own pre-wired receiver (conn 2).
	let mut rx_ana = deps.hub.subscribe(room.clone(), 1).await;
	let mut rx_ben = deps.hub.subscribe(room.clone(), 2).await;

	ops::send_message(&deps, &ana, &send_req("general", "welcome")).await.unwrap();
	let _ = recv_event(&mut rx_ana).await;
	let _ = recv_event(&mut rx_ben).await;

	let data = join(&deps, 2, &ben, "general").await.unwrap();
	let pb::ack::Data::JoinRoom(join_data) = data else {
		panic!("expected JoinRoom ack data");
	};
	let room_view = join_data.room.expect("room snapshot");
	assert!(room_view.members.iter().any(|m| m.user_id == "ben"));
	assert_eq!(join_data.messages.len(), 1);
	assert_eq!(join_data.messages[0].content, "welcome");

	// ana hears the join; ben's own connection does not.
	let env = recv_event(&mut rx_ana).await;
	match env.event {
		Some(pb::event_envelope::Event::UserJoinedRoom(e)) => {
			assert_eq!(e.user.expect("user").id, "ben");
		}
		other => panic!("expected UserJoinedRoom, got {other:?}"),
	}
	assert_silent(&mut rx_ben).await;
}

#[tokio::test]
async fn content_length_is_validated_before_any_store_write() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let room = rid("general");

	let err = ops::send_message(&deps, &ana, &send_req("general", "")).await.unwrap_err();
	assert_eq!(err.code(), Some("emptyContent"));

	let err = ops::send_message(&deps, &ana, &send_req("general", &"x".repeat(2001)))
		.await
		.unwrap_err();
	assert_eq!(err.code(), Some("contentTooLong"));

	// Nothing reached the log or the counter.
	let doc = deps.rooms.load_room(&room).await.unwrap().unwrap();
	assert_eq!(doc.message_count, 0);
	assert!(deps.messages.recent(&room, 10).await.unwrap().is_empty());

	// Exactly at the limit is accepted.
	ops::send_message(&deps, &ana, &send_req("general", &"x".repeat(2000)))
		.await
		.unwrap();
	let doc = deps.rooms.load_room(&room).await.unwrap().unwrap();
	assert_eq!(doc.message_count, 1);
}

#[tokio::test]
async fn send_fans_out_to_all_sessions_including_the_senders_other_connections() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let room = rid("general");

	let mut rx_self = deps.hub.subscribe(room.clone(), 1).await;
	let mut rx_other = deps.hub.subscribe(room.clone(), 2).await;

	let data = ops::send_message(&deps, &ana, &send_req("general", "hello")).await.unwrap();
	let pb::ack::Data::SendMessage(sent) = data else {
		panic!("expected SendMessage ack data");
	};
	let sent = sent.message.expect("message");
	assert_eq!(sent.sender.as_ref().expect("sender").id, "ana");

	for rx in [&mut rx_self, &mut rx_other] {
		let env = recv_event(rx).await;
		match env.event {
			Some(pb::event_envelope::Event::NewMessage(e)) => {
				let m = e.message.expect("message");
				assert_eq!(m.content, "hello");
				assert_eq!(m.id, sent.id);
			}
			other => panic!("expected NewMessage, got {other:?}"),
		}
	}
}

#[tokio::test]
async fn non_members_cannot_send() {
	let Fixture { deps, .. } = fixture().await;
	let err = ops::send_message(&deps, &ident("ben", "Ben"), &send_req("general", "hi"))
		.await
		.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));
}

#[tokio::test]
async fn reply_target_must_live_in_the_same_room() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");

	join(&deps, 1, &ben, "general").await.unwrap();

	// A message in another room cannot be a reply target here.
	let mut other = RoomDoc::new("Other", RoomType::Public, 16, 1);
	other.member_ids.push("ana".to_string());
	other.member_meta.insert("ana".to_string(), meta(RoomRole::Member));
	deps.rooms.create_room(&rid("other"), &other).await.unwrap();
	let pb::ack::Data::SendMessage(elsewhere) =
		ops::send_message(&deps, &ana, &send_req("other", "elsewhere")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};

	let mut req = send_req("general", "replying");
	req.reply_to = elsewhere.message.expect("message").id;
	let err = ops::send_message(&deps, &ben, &req).await.unwrap_err();
	assert_eq!(err.code(), Some("invalidReply"));

	// Replying to a message that is in the room works.
	let pb::ack::Data::SendMessage(here) =
		ops::send_message(&deps, &ana, &send_req("general", "original")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	let mut req = send_req("general", "replying");
	req.reply_to = here.message.expect("message").id.clone();
	let pb::ack::Data::SendMessage(reply) = ops::send_message(&deps, &ben, &req).await.unwrap() else {
		panic!("expected SendMessage data");
	};
	assert_eq!(reply.message.expect("message").reply_to, req.reply_to);
}

#[tokio::test]
async fn typing_is_rate_limited_and_silently_dropped() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let room = rid("general");

	deps.state.write().await.subscribe(1, room.clone());
	let mut rx_other = deps.hub.subscribe(room.clone(), 2).await;

	// Burst of 2 configured in the fixture: the third event is dropped.
	for _ in 0..3 {
		ops::typing(&deps, 1, &ana, "general", true).await;
	}

	for _ in 0..2 {
		let env = recv_event(&mut rx_other).await;
		assert!(matches!(env.event, Some(pb::event_envelope::Event::UserTyping(_))));
	}
	assert_silent(&mut rx_other).await;
}

#[tokio::test]
async fn typing_from_unsubscribed_connections_is_ignored() {
	let Fixture { deps, .. } = fixture().await;
	let room = rid("general");
	let mut rx_other = deps.hub.subscribe(room.clone(), 2).await;

	ops::typing(&deps, 1, &ident("ana", "Ana"), "general", true).await;
	assert_silent(&mut rx_other).await;
}

#[tokio::test]
async fn reactions_replace_per_user_and_broadcast() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let room = rid("general");

	let pb::ack::Data::SendMessage(sent) =
		ops::send_message(&deps, &ana, &send_req("general", "react to me")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	let message_id = sent.message.expect("message").id;

	let mut rx = deps.hub.subscribe(room.clone(), 2).await;

	for emoji in ["👍", "❤️"] {
		ops::add_reaction(
			&deps,
			&ana,
			&pb::AddReaction {
				message_id: message_id.clone(),
				emoji: emoji.to_string(),
			},
		)
		.await
		.unwrap();
	}

	let _ = recv_event(&mut rx).await;
	let env = recv_event(&mut rx).await;
	match env.event {
		Some(pb::event_envelope::Event::ReactionAdded(e)) => {
			assert_eq!(e.reaction.expect("reaction").emoji, "❤️");
		}
		other => panic!("expected ReactionAdded, got {other:?}"),
	}

	let stored = deps
		.messages
		.load(&message_id.parse().unwrap())
		.await
		.unwrap()
		.expect("message");
	assert_eq!(stored.reactions.len(), 1);
	assert_eq!(stored.reactions[0].emoji, "❤️");
}

#[tokio::test]
async fn delete_is_owner_or_moderator_only() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");

	join(&deps, 1, &ben, "general").await.unwrap();

	let pb::ack::Data::SendMessage(sent) =
		ops::send_message(&deps, &ana, &send_req("general", "target")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	let message_id = sent.message.expect("message").id;

	// ben is a plain member and not the sender.
	let err = ops::delete_message(&deps, &ben, &pb::DeleteMessage { message_id: message_id.clone() })
		.await
		.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));

	// The sender may delete their own message.
	ops::delete_message(&deps, &ana, &pb::DeleteMessage { message_id: message_id.clone() })
		.await
		.unwrap();
	let stored = deps.messages.load(&message_id.parse().unwrap()).await.unwrap().unwrap();
	assert!(stored.deleted);
}

#[tokio::test]
async fn moderation_requires_a_room_role_and_broadcasts_distinctly() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");
	let room = rid("general");

	join(&deps, 1, &ben, "general").await.unwrap();
	let pb::ack::Data::SendMessage(sent) =
		ops::send_message(&deps, &ben, &send_req("general", "shady link")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	let message_id = sent.message.expect("message").id;

	let err = ops::moderate_message(
		&deps,
		&ben,
		&pb::ModerateMessage {
			message_id: message_id.clone(),
			reason: "spam".to_string(),
		},
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));

	let mut rx = deps.hub.subscribe(room.clone(), 2).await;

	ops::moderate_message(
		&deps,
		&ana,
		&pb::ModerateMessage {
			message_id: message_id.clone(),
			reason: "spam".to_string(),
		},
	)
	.await
	.unwrap();

	let env = recv_event(&mut rx).await;
	match env.event {
		Some(pb::event_envelope::Event::MessageModerated(e)) => {
			assert_eq!(e.message_id, message_id);
			assert_eq!(e.moderated_by, "ana");
			assert_eq!(e.reason, "spam");
		}
		other => panic!("expected MessageModerated, got {other:?}"),
	}
}

#[tokio::test]
async fn pin_toggle_flips_message_and_room_state() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let room = rid("general");

	let pb::ack::Data::SendMessage(sent) =
		ops::send_message(&deps, &ana, &send_req("general", "important")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	let message_id = sent.message.expect("message").id;

	let req = pb::TogglePinMessage {
		message_id: message_id.clone(),
	};
	ops::toggle_pin_message(&deps, &ana, &req).await.unwrap();

	let doc = deps.rooms.load_room(&room).await.unwrap().unwrap();
	assert_eq!(doc.pinned_message_ids, vec![message_id.clone()]);
	assert!(deps.messages.load(&message_id.parse().unwrap()).await.unwrap().unwrap().pinned);

	ops::toggle_pin_message(&deps, &ana, &req).await.unwrap();
	let doc = deps.rooms.load_room(&room).await.unwrap().unwrap();
	assert!(doc.pinned_message_ids.is_empty());
}

#[tokio::test]
async fn any_member_may_report_and_moderators_hear_about_it() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");
	let mia = ident("mia", "Mia");
	let room = rid("general");

	join(&deps, 1, &ben, "general").await.unwrap();

	let pb::ack::Data::SendMessage(sent) =
		ops::send_message(&deps, &ana, &send_req("general", "reported")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	let message_id = sent.message.expect("message").id;

	// Non-member cannot report.
	let err = ops::report_message(
		&deps,
		&mia,
		&pb::ReportMessage {
			message_id: message_id.clone(),
			reason: "harassment".to_string(),
			description: String::new(),
		},
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));

	let mut rx = deps.hub.subscribe(room.clone(), 2).await;

	ops::report_message(
		&deps,
		&ben,
		&pb::ReportMessage {
			message_id: message_id.clone(),
			reason: "harassment".to_string(),
			description: "see thread".to_string(),
		},
	)
	.await
	.unwrap();

	let env = recv_event(&mut rx).await;
	match env.event {
		Some(pb::event_envelope::Event::NewReport(e)) => {
			let report = e.report.expect("report");
			assert_eq!(report.reporter_id, "ben");
			assert_eq!(report.message_id, message_id);
		}
		other => panic!("expected NewReport, got {other:?}"),
	}
}

#[tokio::test]
async fn ban_is_admin_only_atomic_and_blocks_rejoin() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");
	let mia = ident("mia", "Mia");
	let room = rid("general");

	join(&deps, 1, &ben, "general").await.unwrap();
	join(&deps, 2, &mia, "general").await.unwrap();

	// A plain member cannot ban.
	let err = ops::ban_user(
		&deps,
		&mia,
		&pb::BanUser {
			room_id: "general".to_string(),
			user_id: "ben".to_string(),
			reason: String::new(),
		},
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));

	ops::ban_user(
		&deps,
		&ana,
		&pb::BanUser {
			room_id: "general".to_string(),
			user_id: "ben".to_string(),
			reason: "conduct".to_string(),
		},
	)
	.await
	.unwrap();

	let doc = deps.rooms.load_room(&room).await.unwrap().unwrap();
	assert!(doc.is_banned(&ben.id));
	assert!(!doc.is_member(&ben.id));

	let err = join(&deps, 1, &ben, "general").await.unwrap_err();
	assert_eq!(err.code(), Some("banned"));

	// Unban restores joinability.
	ops::unban_user(
		&deps,
		&ana,
		&pb::UnbanUser {
			room_id: "general".to_string(),
			user_id: "ben".to_string(),
		},
	)
	.await
	.unwrap();
	join(&deps, 1, &ben, "general").await.unwrap();
}

#[tokio::test]
async fn role_management_is_admin_only_and_promotion_takes_effect() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");
	let mia = ident("mia", "Mia");

	join(&deps, 1, &ben, "general").await.unwrap();
	join(&deps, 2, &mia, "general").await.unwrap();

	let promote = pb::SetMemberRole {
		room_id: "general".to_string(),
		user_id: "ben".to_string(),
		role: pb::RoomRole::Moderator as i32,
	};

	let err = ops::set_member_role(&deps, &mia, &promote).await.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));

	ops::set_member_role(&deps, &ana, &promote).await.unwrap();

	// ben can now moderate mia's message.
	let pb::ack::Data::SendMessage(sent) =
		ops::send_message(&deps, &mia, &send_req("general", "borderline")).await.unwrap()
	else {
		panic!("expected SendMessage data");
	};
	ops::moderate_message(
		&deps,
		&ben,
		&pb::ModerateMessage {
			message_id: sent.message.expect("message").id,
			reason: "tone".to_string(),
		},
	)
	.await
	.unwrap();

	// The admin role is never granted over the wire.
	let err = ops::set_member_role(
		&deps,
		&ana,
		&pb::SetMemberRole {
			room_id: "general".to_string(),
			user_id: "ben".to_string(),
			role: pb::RoomRole::Admin as i32,
		},
	)
	.await
	.unwrap_err();
	assert_eq!(err.code(), Some("permissionDenied"));
}

#[tokio::test]
async fn room_listing_pages_by_activity() {
	let Fixture { deps, .. } = fixture().await;

	for (id, activity) in [("alps", 50i64), ("beaches", 40), ("trails", 60)] {
		let mut doc = RoomDoc::new(id, RoomType::Public, 16, 1);
		doc.last_activity_unix_ms = activity;
		deps.rooms.create_room(&rid(id), &doc).await.unwrap();
	}

	let data = ops::get_rooms(
		&deps,
		&pb::GetRooms {
			room_type: pb::RoomType::Public as i32,
			page: 0,
			limit: 2,
		},
	)
	.await
	.unwrap();

	let pb::ack::Data::Rooms(list) = data else {
		panic!("expected Rooms ack data");
	};
	let ids: Vec<&str> = list.rooms.iter().map(|r| r.id.as_str()).collect();
	assert_eq!(ids, vec!["trails", "alps"]);
	let pagination = list.pagination.expect("pagination");
	assert_eq!(pagination.total, 4);
	assert!(pagination.has_more);
}

/// A joins, B sends, A sees the message before B's ack is consumed, then A
/// replies to it.
#[tokio::test]
async fn join_send_reply_scenario_orders_correctly() {
	let Fixture { deps, .. } = fixture().await;
	let ana = ident("ana", "Ana");
	let ben = ident("ben", "Ben");
	let room = rid("general");

	// A (ben, conn 1) joins; the session layer would wire this receiver.
	join(&deps, 1, &ben, "general").await.unwrap();
	let mut rx_ben = deps.hub.subscribe(room.clone(), 1).await;

	// B (ana, already a member) sends "hello". The broadcast is enqueued
	// before the ack data is returned.
	let ack = ops::send_message(&deps, &ana, &send_req("general", "hello")).await.unwrap();

	let env = recv_event(&mut rx_ben).await;
	let pb::event_envelope::Event::NewMessage(seen) = env.event.expect("event") else {
		panic!("expected NewMessage");
	};
	let seen = seen.message.expect("message");
	assert_eq!(seen.content, "hello");
	assert_eq!(seen.sender.expect("sender").id, "ana");

	let pb::ack::Data::SendMessage(sent) = ack else {
		panic!("expected SendMessage data");
	};
	assert_eq!(sent.message.expect("message").id, seen.id);

	// A replies to the message it just received.
	let mut reply = send_req("general", "hi back");
	reply.reply_to = seen.id.clone();
	let pb::ack::Data::SendMessage(replied) = ops::send_message(&deps, &ben, &reply).await.unwrap() else {
		panic!("expected SendMessage data");
	};
	assert_eq!(replied.message.expect("message").reply_to, seen.id);
}
