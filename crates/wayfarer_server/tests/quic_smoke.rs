#![forbid(unsafe_code)]

//! Loopback smoke test: the real client against the real session handler
//! over QUIC with a dev self-signed certificate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use wayfarer_client_core::{ChatClient, ChatEvent, ClientConfig, ClientError, EventKind};
use wayfarer_domain::{MessageKind, RoomId, RoomRole, RoomType, UserId, UserRole};
use wayfarer_server::config::ChatSettings;
use wayfarer_server::quic::config::{CertSource, QuicServerConfig};
use wayfarer_server::server::deps::ChatDeps;
use wayfarer_server::server::session::handle_connection;
use wayfarer_services::{HmacIdentityProvider, SecretString, TierEntitlementProvider, sign_token};
use wayfarer_store::{DocumentStore, MemStore, MemberMeta, PresenceStore, RoomDoc, UserRecord};

const SECRET: &str = "smoke-secret";
const FAR_FUTURE: u64 = 4_000_000_000;

fn uid(s: &str) -> UserId {
	UserId::new(s).expect("valid user id")
}

async fn start_server() -> (SocketAddr, Arc<ChatDeps>) {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	let store = MemStore::shared();
	let doc_store: Arc<dyn DocumentStore> = store;

	let presence = PresenceStore::new(Arc::clone(&doc_store));
	for (id, name) in [("ana", "Ana"), ("ben", "Ben")] {
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
			.expect("seed user");
	}

	let identity = HmacIdentityProvider::new(SecretString::new(SECRET), presence);
	let entitlement = TierEntitlementProvider::new(Arc::clone(&doc_store));
	let deps = ChatDeps::new(Arc::clone(&doc_store), identity, entitlement, ChatSettings::default());

	// ben is seeded as an existing member of `general`.
	let mut general = RoomDoc::new("General", RoomType::Public, 16, 1);
	general.member_ids.push("ben".to_string());
	general.member_meta.insert(
		"ben".to_string(),
		MemberMeta {
			role: RoomRole::Member,
			joined_at_unix_ms: 1,
			last_read_unix_ms: 1,
		},
	);
	deps.rooms
		.create_room(&RoomId::new("general").expect("room id"), &general)
		.await
		.expect("seed room");

	let bind: SocketAddr = "127.0.0.1:0".parse().expect("bind addr");
	let (endpoint, _cert) = QuicServerConfig::new(bind, CertSource::DevSelfSigned)
		.bind_endpoint()
		.expect("bind endpoint");
	let addr = endpoint.local_addr().expect("local addr");

	let accept_deps = Arc::clone(&deps);
	tokio::spawn(async move {
		let mut next_conn_id = 1u64;
		while let Some(connecting) = endpoint.accept().await {
			let conn_id = next_conn_id;
			next_conn_id += 1;
			let deps = Arc::clone(&accept_deps);
			tokio::spawn(async move {
				if let Ok(connection) = connecting.await {
					let _ = handle_connection(conn_id, connection, deps).await;
				}
			});
		}
	});

	(addr, deps)
}

fn client_for(addr: SocketAddr) -> ChatClient {
	ChatClient::new(ClientConfig {
		server_host: "localhost".to_string(),
		server_port: addr.port(),
		server_addr: Some(addr),
		connect_timeout: Duration::from_secs(5),
		..ClientConfig::default()
	})
}

fn capture(client: &ChatClient, kind: EventKind) -> mpsc::Receiver<ChatEvent> {
	let (tx, rx) = mpsc::channel(32);
	client.subscribe(
		kind,
		Arc::new(move |event: &ChatEvent| {
			let _ = tx.try_send(event.clone());
		}),
	);
	rx
}

#[tokio::test]
async fn handshake_join_send_and_broadcast_roundtrip() {
	let (addr, deps) = start_server().await;

	let ana = client_for(addr);
	let ben = client_for(addr);

	ana.connect(sign_token("ana", FAR_FUTURE, SECRET)).await.expect("ana connects");
	ben.connect(sign_token("ben", FAR_FUTURE, SECRET)).await.expect("ben connects");

	// ben is already a member; joining re-subscribes and is a no-op success.
	let mut ben_joins = capture(&ben, EventKind::UserJoined);
	let mut ben_messages = capture(&ben, EventKind::NewMessage);
	ben.join_room("general").await.expect("ben joins");

	// ana joins; ben hears about it, ana gets only the ack.
	let joined = ana.join_room("general").await.expect("ana joins");
	assert!(joined.room.members.iter().any(|m| m.user_id == "ana"));
	assert!(joined.room.members.iter().any(|m| m.user_id == "ben"));

	let join_event = timeout(Duration::from_secs(5), ben_joins.recv())
		.await
		.expect("join broadcast within timeout")
		.expect("subscription alive");
	match join_event {
		ChatEvent::UserJoined { room_id, user } => {
			assert_eq!(room_id, "general");
			assert_eq!(user.id, "ana");
		}
		other => panic!("expected UserJoined, got {other:?}"),
	}

	// ana sends; ben receives the broadcast; the ack and the event agree.
	let sent = ana
		.send_message("general", "hello from lisbon", MessageKind::Text, None)
		.await
		.expect("send acked");

	let seen = timeout(Duration::from_secs(5), ben_messages.recv())
		.await
		.expect("message broadcast within timeout")
		.expect("subscription alive");
	match seen {
		ChatEvent::NewMessage(m) => {
			assert_eq!(m.content, "hello from lisbon");
			assert_eq!(m.id, sent.id);
			assert_eq!(m.sender.expect("sender").id, "ana");
		}
		other => panic!("expected NewMessage, got {other:?}"),
	}

	// ben replies to the message he just received.
	let reply = ben
		.send_message("general", "welcome!", MessageKind::Text, Some(sent.id.clone()))
		.await
		.expect("reply acked");
	assert_eq!(reply.reply_to, sent.id);

	// Presence: ana went online at handshake and offline after disconnect.
	let rec = deps.presence.load_user(&uid("ana")).await.expect("load").expect("record");
	assert!(rec.online);

	ana.disconnect().await.expect("disconnect");
	// The server runs its cleanup on transport close.
	tokio::time::sleep(Duration::from_millis(500)).await;
	let rec = deps.presence.load_user(&uid("ana")).await.expect("load").expect("record");
	assert!(!rec.online, "presence must flip offline on disconnect");
}

#[tokio::test]
async fn handshake_rejections_carry_typed_codes() {
	let (addr, _deps) = start_server().await;

	let client = client_for(addr);
	let err = client.connect("garbage-token").await.expect_err("must fail");
	match err {
		ClientError::Auth { code, .. } => assert_eq!(code, "invalid"),
		other => panic!("expected Auth error, got {other:?}"),
	}

	let err = client
		.connect(sign_token("ana", 1, SECRET))
		.await
		.expect_err("expired must fail");
	match err {
		ClientError::Auth { code, .. } => assert_eq!(code, "expired"),
		other => panic!("expected Auth error, got {other:?}"),
	}

	let err = client
		.connect(sign_token("ghost", FAR_FUTURE, SECRET))
		.await
		.expect_err("unknown account must fail");
	match err {
		ClientError::Auth { code, .. } => assert_eq!(code, "account-deactivated"),
		other => panic!("expected Auth error, got {other:?}"),
	}
}

#[tokio::test]
async fn leave_room_acks_and_notifies_the_remaining_member() {
	let (addr, _deps) = start_server().await;

	let ana = client_for(addr);
	let ben = client_for(addr);
	ana.connect(sign_token("ana", FAR_FUTURE, SECRET)).await.expect("ana connects");
	ben.connect(sign_token("ben", FAR_FUTURE, SECRET)).await.expect("ben connects");

	ben.join_room("general").await.expect("ben joins");
	ana.join_room("general").await.expect("ana joins");

	let mut ben_leaves = capture(&ben, EventKind::UserLeft);

	ana.leave_room("general").await.expect("leave acks");

	let left = timeout(Duration::from_secs(5), ben_leaves.recv())
		.await
		.expect("leave broadcast within timeout")
		.expect("subscription alive");
	match left {
		ChatEvent::UserLeft { room_id, user } => {
			assert_eq!(room_id, "general");
			assert_eq!(user.id, "ana");
		}
		other => panic!("expected UserLeft, got {other:?}"),
	}
}
