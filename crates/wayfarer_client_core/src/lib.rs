#![forbid(unsafe_code)]

//! Client connection manager for the wayfarer chat protocol.
//!
//! [`ChatClient`] keeps exactly one logical connection to the chat server
//! and hides transport-level reconnects from callers: concurrent connects
//! coalesce into one handshake, transport loss retries with exponential
//! backoff until a configured ceiling, token refresh is single-flight, and
//! every request/response operation is deadline-bounded.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use wayfarer_domain::RoomType;
use wayfarer_protocol::framing::DEFAULT_MAX_FRAME_SIZE;
use wayfarer_protocol::{convert, pb};
use wayfarer_util::endpoint::QuicEndpoint;

pub mod api;
pub mod backoff;
pub mod subscriptions;
pub mod wire;

mod driver;


pub use backoff::{BackoffConfig, backoff_delay};
pub use subscriptions::{ChatEvent, EventCallback, EventKind, SubscriptionHandle, Subscriptions};

use api::SessionFactory;
use driver::Command;

/// Async token-refresh callback supplied by the application. Invoked at
/// most once concurrently; concurrent auth failures share one invocation.
pub type TokenRefreshFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Client identifier.
	pub client_name: String,

	/// Client instance id.
	pub client_instance_id: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,

	/// Deadline for most request/response operations.
	pub request_timeout: Duration,

	/// Deadline for `join_room`.
	pub join_timeout: Duration,

	/// Deadline for `leave_room` (timing out resolves as soft success).
	pub leave_timeout: Duration,

	/// Reconnect policy.
	pub backoff: BackoffConfig,

	pub keepalive_interval: Duration,
	pub keepalive_timeout: Duration,
	pub keepalive_max_failures: u32,
}

impl ClientConfig {
	/// Convenience: create a config from `quic://host:port`.
	pub fn from_quic_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok(Self {
			server_host: e.host,
			server_port: e.port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		// Local dev default.
		Self {
			server_host: "localhost".to_string(),
			server_port: 18421,
			server_addr: Some("127.0.0.1:18421".parse().expect("valid default addr")),
			client_name: format!("wayfarer-client-core/{}", env!("CARGO_PKG_VERSION")),
			client_instance_id: "dev-instance".to_string(),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
			request_timeout: Duration::from_secs(10),
			join_timeout: Duration::from_secs(10),
			leave_timeout: Duration::from_secs(5),
			backoff: BackoffConfig::default(),
			keepalive_interval: Duration::from_secs(3),
			keepalive_timeout: Duration::from_secs(10),
			keepalive_max_failures: 3,
		}
	}
}

/// Errors surfaced to callers of [`ChatClient`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error("authentication failed ({code}): {message}")]
	Auth { code: String, message: String },

	/// The server rejected an operation via the ack envelope.
	#[error("{message} ({code})")]
	Server { code: String, message: String },

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("operation timed out: {0}")]
	Timeout(String),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("reconnect attempts exhausted after {attempts} tries")]
	RetriesExhausted { attempts: u32 },

	#[error("client closed: {0}")]
	Closed(String),
}

impl ClientError {
	/// The server-supplied ack code, when one applies.
	pub fn server_code(&self) -> Option<&str> {
		match self {
			ClientError::Server { code, .. } if !code.is_empty() => Some(code),
			ClientError::Auth { code, .. } => Some(code),
			_ => None,
		}
	}
}

/// Room snapshot plus recent-message window returned by a join.
#[derive(Debug, Clone)]
pub struct JoinedRoom {
	pub room: pb::Room,
	pub messages: Vec<pb::Message>,
}

/// One page of the room listing.
#[derive(Debug, Clone)]
pub struct RoomList {
	pub rooms: Vec<pb::Room>,
	pub pagination: pb::Pagination,
}

/// Handle to the connection driver. Cheap to clone; all clones share the
/// same logical connection.
#[derive(Clone)]
pub struct ChatClient {
	cfg: Arc<ClientConfig>,
	cmd_tx: mpsc::Sender<Command>,
	subs: Arc<Subscriptions>,
}

impl ChatClient {
	/// Create a client speaking real QUIC. Must be called on a tokio
	/// runtime; the driver task starts immediately but stays disconnected
	/// until [`ChatClient::connect`].
	pub fn new(cfg: ClientConfig) -> Self {
		Self::with_session_factory(cfg, Box::new(|params| Box::pin(wire::connect_quic(params))))
	}

	/// Create a client with an injected session factory (test seam).
	pub fn with_session_factory(cfg: ClientConfig, factory: SessionFactory) -> Self {
		let (cmd_tx, cmd_rx) = mpsc::channel(64);
		let subs = Arc::new(Subscriptions::new());

		tokio::spawn(driver::run_driver(cfg.clone(), cmd_rx, Arc::clone(&subs), factory));

		Self {
			cfg: Arc::new(cfg),
			cmd_tx,
			subs,
		}
	}

	/// Establish (or reuse) the logical connection using `token`.
	///
	/// Concurrent calls share one handshake attempt. Calling with the token
	/// of an already-live session is a no-op success; a different token
	/// tears the old transport down first.
	pub async fn connect(&self, token: impl Into<String>) -> Result<(), ClientError> {
		let (tx, rx) = oneshot::channel();
		self.send_command(Command::Connect {
			token: token.into(),
			reply: tx,
		})
		.await?;
		rx.await.map_err(|_| ClientError::Closed("driver stopped".to_string()))?
	}

	/// Permanently end the session: suppresses all pending reconnection
	/// logic and never trips the retry ceiling.
	pub async fn disconnect(&self) -> Result<(), ClientError> {
		let (tx, rx) = oneshot::channel();
		self.send_command(Command::Disconnect { reply: tx }).await?;
		rx.await.map_err(|_| ClientError::Closed("driver stopped".to_string()))
	}

	/// Register the async token-refresh callback invoked (single-flight)
	/// on authentication failures.
	pub async fn set_token_refresh(&self, refresh: TokenRefreshFn) -> Result<(), ClientError> {
		self.send_command(Command::SetRefresh { refresh }).await
	}

	/// Join a room; the ack carries the room snapshot and a bounded
	/// recent-message window.
	pub async fn join_room(&self, room_id: impl Into<String>) -> Result<JoinedRoom, ClientError> {
		let msg = pb::envelope::Msg::JoinRoom(pb::JoinRoom { room_id: room_id.into() });
		match self.request_ack(msg, self.cfg.join_timeout).await? {
			Some(pb::ack::Data::JoinRoom(data)) => Ok(JoinedRoom {
				room: data.room.ok_or_else(|| ClientError::Protocol("join ack missing room".to_string()))?,
				messages: data.messages,
			}),
			other => Err(ClientError::Protocol(format!("unexpected join ack payload: {other:?}"))),
		}
	}

	/// Leave a room. A timeout resolves as soft success: the intent to stop
	/// caring about the room is satisfiable locally even if the ack never
	/// arrives.
	pub async fn leave_room(&self, room_id: impl Into<String>) -> Result<(), ClientError> {
		let msg = pb::envelope::Msg::LeaveRoom(pb::LeaveRoom { room_id: room_id.into() });
		match self.request_ack(msg, self.cfg.leave_timeout).await {
			Ok(_) => Ok(()),
			Err(ClientError::Timeout(_)) => Ok(()),
			Err(e) => Err(e),
		}
	}

	pub async fn send_message(
		&self,
		room_id: impl Into<String>,
		content: impl Into<String>,
		kind: wayfarer_domain::MessageKind,
		reply_to: Option<String>,
	) -> Result<pb::Message, ClientError> {
		let msg = pb::envelope::Msg::SendMessage(pb::SendMessage {
			room_id: room_id.into(),
			content: content.into(),
			kind: convert::message_kind_to_wire(kind) as i32,
			reply_to: reply_to.unwrap_or_default(),
		});
		match self.request_ack(msg, self.cfg.request_timeout).await? {
			Some(pb::ack::Data::SendMessage(data)) => data
				.message
				.ok_or_else(|| ClientError::Protocol("send ack missing message".to_string())),
			other => Err(ClientError::Protocol(format!("unexpected send ack payload: {other:?}"))),
		}
	}

	pub async fn list_rooms(&self, room_type: Option<RoomType>, page: u32, limit: u32) -> Result<RoomList, ClientError> {
		let msg = pb::envelope::Msg::GetRooms(pb::GetRooms {
			room_type: room_type.map(|t| convert::room_type_to_wire(t) as i32).unwrap_or(0),
			page,
			limit,
		});
		match self.request_ack(msg, self.cfg.request_timeout).await? {
			Some(pb::ack::Data::Rooms(data)) => Ok(RoomList {
				rooms: data.rooms,
				pagination: data.pagination.unwrap_or_default(),
			}),
			other => Err(ClientError::Protocol(format!("unexpected rooms ack payload: {other:?}"))),
		}
	}

	/// Fire-and-forget typing indicator.
	pub async fn typing_start(&self, room_id: impl Into<String>) -> Result<(), ClientError> {
		self.send_command(Command::Fire {
			msg: pb::envelope::Msg::TypingStart(pb::TypingStart { room_id: room_id.into() }),
		})
		.await
	}

	pub async fn typing_stop(&self, room_id: impl Into<String>) -> Result<(), ClientError> {
		self.send_command(Command::Fire {
			msg: pb::envelope::Msg::TypingStop(pb::TypingStop { room_id: room_id.into() }),
		})
		.await
	}

	/// Fire-and-forget reaction; replaces any previous reaction by this
	/// user on the message.
	pub async fn add_reaction(&self, message_id: impl Into<String>, emoji: impl Into<String>) -> Result<(), ClientError> {
		self.send_command(Command::Fire {
			msg: pb::envelope::Msg::AddReaction(pb::AddReaction {
				message_id: message_id.into(),
				emoji: emoji.into(),
			}),
		})
		.await
	}

	pub async fn delete_message(&self, message_id: impl Into<String>) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::DeleteMessage(pb::DeleteMessage {
			message_id: message_id.into(),
		}))
		.await
	}

	pub async fn report_message(
		&self,
		message_id: impl Into<String>,
		reason: impl Into<String>,
		description: Option<String>,
	) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::ReportMessage(pb::ReportMessage {
			message_id: message_id.into(),
			reason: reason.into(),
			description: description.unwrap_or_default(),
		}))
		.await
	}

	pub async fn moderate_message(
		&self,
		message_id: impl Into<String>,
		reason: impl Into<String>,
	) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::ModerateMessage(pb::ModerateMessage {
			message_id: message_id.into(),
			reason: reason.into(),
		}))
		.await
	}

	pub async fn toggle_pin_message(&self, message_id: impl Into<String>) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::TogglePinMessage(pb::TogglePinMessage {
			message_id: message_id.into(),
		}))
		.await
	}

	pub async fn ban_user(
		&self,
		room_id: impl Into<String>,
		user_id: impl Into<String>,
		reason: Option<String>,
	) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::BanUser(pb::BanUser {
			room_id: room_id.into(),
			user_id: user_id.into(),
			reason: reason.unwrap_or_default(),
		}))
		.await
	}

	pub async fn unban_user(&self, room_id: impl Into<String>, user_id: impl Into<String>) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::UnbanUser(pb::UnbanUser {
			room_id: room_id.into(),
			user_id: user_id.into(),
		}))
		.await
	}

	pub async fn set_member_role(
		&self,
		room_id: impl Into<String>,
		user_id: impl Into<String>,
		role: wayfarer_domain::RoomRole,
	) -> Result<(), ClientError> {
		self.request_unit(pb::envelope::Msg::SetMemberRole(pb::SetMemberRole {
			room_id: room_id.into(),
			user_id: user_id.into(),
			role: convert::room_role_to_wire(role) as i32,
		}))
		.await
	}

	/// Register a callback for one event kind. The returned handle
	/// unsubscribes exactly that callback.
	pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionHandle {
		self.subs.subscribe(kind, callback)
	}

	pub fn unsubscribe(&self, handle: SubscriptionHandle) {
		self.subs.unsubscribe(handle);
	}

	/// Remove every callback for one event kind.
	pub fn clear_subscriptions(&self, kind: EventKind) {
		self.subs.clear(kind);
	}

	/// Remove every callback for every event.
	pub fn clear_all_subscriptions(&self) {
		self.subs.clear_all();
	}

	async fn send_command(&self, cmd: Command) -> Result<(), ClientError> {
		self.cmd_tx
			.send(cmd)
			.await
			.map_err(|_| ClientError::Closed("driver not running".to_string()))
	}

	async fn request(&self, msg: pb::envelope::Msg, timeout: Duration) -> Result<pb::envelope::Msg, ClientError> {
		let (tx, rx) = oneshot::channel();
		self.send_command(Command::Request { msg, timeout, reply: tx }).await?;
		rx.await.map_err(|_| ClientError::Closed("driver dropped the request".to_string()))?
	}

	async fn request_ack(
		&self,
		msg: pb::envelope::Msg,
		timeout: Duration,
	) -> Result<Option<pb::ack::Data>, ClientError> {
		match self.request(msg, timeout).await? {
			pb::envelope::Msg::Ack(ack) => {
				if ack.success {
					Ok(ack.data)
				} else {
					Err(ClientError::Server {
						code: ack.code,
						message: ack.message,
					})
				}
			}
			other => Err(ClientError::Protocol(format!("expected Ack, got {other:?}"))),
		}
	}

	async fn request_unit(&self, msg: pb::envelope::Msg) -> Result<(), ClientError> {
		self.request_ack(msg, self.cfg.request_timeout).await.map(|_| ())
	}
}
