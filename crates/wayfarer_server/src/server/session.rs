#![forbid(unsafe_code)]

//! Per-connection session state machine.
//!
//! One connection gets one control stream (requests + correlated acks,
//! processed serially) and one events stream (broadcast fan-out). The
//! handshake must authenticate before any room operation is reachable, and
//! the disconnect cleanup path runs exactly once however the connection
//! ends.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wayfarer_domain::RoomId;
use wayfarer_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FrameDecoder, encode_frame};
use wayfarer_protocol::{convert, pb};
use wayfarer_services::UserIdentity;
use wayfarer_util::time::unix_ms_now;

use crate::server::deps::ChatDeps;
use crate::server::ops;
use crate::server::room_hub::RoomHubItem;

/// Queue depth between room forwarders and the events writer.
const FAN_IN_CAPACITY: usize = 1024;

pub fn server_name() -> String {
	format!("wayfarer-server/{}", env!("CARGO_PKG_VERSION"))
}

pub async fn handle_connection(conn_id: u64, connection: quinn::Connection, deps: Arc<ChatDeps>) -> anyhow::Result<()> {
	struct SessionGaugeGuard;
	impl Drop for SessionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("wayfarer_server_active_sessions").decrement(1.0);
		}
	}

	metrics::gauge!("wayfarer_server_active_sessions").increment(1.0);
	let _session_guard = SessionGaugeGuard;

	let (mut control_send, control_recv) = connection.accept_bi().await.context("accept control stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = spawn_control_reader(conn_id, control_recv, ctrl_tx);

	let hello = wait_for_hello(&mut ctrl_rx).await?;
	info!(
		conn_id,
		client_name = %hello.client_name,
		client_instance_id = %hello.client_instance_id,
		"received Hello"
	);
	metrics::counter!("wayfarer_server_hello_total").increment(1);

	let user = match deps.identity.resolve_token(&hello.token).await {
		Ok(user) => user,
		Err(e) => {
			let kind = e.auth_kind();
			warn!(conn_id, code = kind.code(), error = %e, "handshake rejected");
			metrics::counter!("wayfarer_server_auth_rejected_total").increment(1);
			send_envelope(
				&mut control_send,
				convert::envelope(
					String::new(),
					pb::envelope::Msg::Error(pb::Error {
						code: kind.code().to_string(),
						message: kind.to_string(),
						request_id: String::new(),
					}),
				),
			)
			.await
			.ok();
			return Ok(());
		}
	};

	info!(conn_id, user = %user.id, "session authenticated");

	// One presence write per successful handshake, not per event.
	deps.presence
		.set_online(&user.id, true, unix_ms_now())
		.await
		.context("mark presence online")?;
	deps.state.write().await.bind_user(conn_id, user.id.clone());

	let (fan_in_tx, fan_in_rx) = mpsc::channel::<RoomHubItem>(FAN_IN_CAPACITY);
	let events_task = tokio::spawn(run_events_writer(conn_id, connection.clone(), fan_in_rx));
	let mut forwarders: HashMap<RoomId, JoinHandle<()>> = HashMap::new();

	// From here on every exit, error included, must run the cleanup below.
	let loop_result = async {
		send_envelope(
			&mut control_send,
			convert::envelope(
				String::new(),
				pb::envelope::Msg::Welcome(pb::Welcome {
					server_name: server_name(),
					server_instance_id: format!("conn-{conn_id}"),
					server_time_unix_ms: unix_ms_now(),
					max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
					user: Some(ops::identity_to_wire(&user, true)),
				}),
			),
		)
		.await
		.context("send Welcome")?;

		broadcast_status(&deps, conn_id, &user, true).await;

		run_control_loop(
			conn_id,
			&deps,
			&user,
			&mut ctrl_rx,
			&mut control_send,
			&fan_in_tx,
			&mut forwarders,
		)
		.await
	}
	.await;

	// Exactly-once disconnect cleanup: every exit from the control loop
	// funnels through here, and the connection task is never re-entered.
	for (_, handle) in forwarders.drain() {
		handle.abort();
	}
	events_task.abort();

	let (_, rooms) = deps.state.write().await.remove_conn(conn_id);
	for room in &rooms {
		deps.hub.unsubscribe(room, conn_id).await;
	}

	if let Err(e) = deps.presence.set_online(&user.id, false, unix_ms_now()).await {
		warn!(conn_id, user = %user.id, error = %e, "failed to mark presence offline");
	}
	broadcast_status(&deps, conn_id, &user, false).await;

	let _ = reader_task.await;
	info!(conn_id, user = %user.id, "session closed");

	loop_result
}

#[allow(clippy::too_many_arguments)]
async fn run_control_loop(
	conn_id: u64,
	deps: &Arc<ChatDeps>,
	user: &UserIdentity,
	ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>,
	control_send: &mut quinn::SendStream,
	fan_in_tx: &mpsc::Sender<RoomHubItem>,
	forwarders: &mut HashMap<RoomId, JoinHandle<()>>,
) -> anyhow::Result<()> {
	while let Some(env) = ctrl_rx.recv().await {
		let request_id = env.request_id;
		let Some(msg) = env.msg else { continue };

		match msg {
			pb::envelope::Msg::JoinRoom(req) => {
				let ack = match ops::join_room(deps, conn_id, user, &req).await {
					Ok(data) => {
						if let Ok(room_id) = RoomId::new(req.room_id.trim()) {
							subscribe_conn(deps, conn_id, room_id, fan_in_tx, forwarders).await;
						}
						convert::ack_success_with(data)
					}
					Err(e) => {
						debug!(conn_id, error = %e, "join_room rejected");
						convert::ack_failure(&e)
					}
				};
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::LeaveRoom(req) => {
				let ack = match ops::leave_room(deps, conn_id, user, &req).await {
					Ok(()) => {
						if let Ok(room_id) = RoomId::new(req.room_id.trim()) {
							unsubscribe_conn(deps, conn_id, &room_id, forwarders).await;
						}
						convert::ack_success()
					}
					Err(e) => convert::ack_failure(&e),
				};
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::SendMessage(req) => {
				let ack = match ops::send_message(deps, user, &req).await {
					Ok(data) => convert::ack_success_with(data),
					Err(e) => {
						debug!(conn_id, error = %e, "send_message rejected");
						convert::ack_failure(&e)
					}
				};
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::TypingStart(req) => {
				ops::typing(deps, conn_id, user, &req.room_id, true).await;
			}

			pb::envelope::Msg::TypingStop(req) => {
				ops::typing(deps, conn_id, user, &req.room_id, false).await;
			}

			pb::envelope::Msg::AddReaction(req) => {
				if let Err(e) = ops::add_reaction(deps, user, &req).await {
					debug!(conn_id, error = %e, "add_reaction dropped");
				}
			}

			pb::envelope::Msg::GetRooms(req) => {
				let ack = match ops::get_rooms(deps, &req).await {
					Ok(data) => convert::ack_success_with(data),
					Err(e) => convert::ack_failure(&e),
				};
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::DeleteMessage(req) => {
				let ack = result_ack(ops::delete_message(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::ReportMessage(req) => {
				let ack = result_ack(ops::report_message(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::ModerateMessage(req) => {
				let ack = result_ack(ops::moderate_message(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::TogglePinMessage(req) => {
				let ack = result_ack(ops::toggle_pin_message(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::BanUser(req) => {
				let ack = result_ack(ops::ban_user(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::UnbanUser(req) => {
				let ack = result_ack(ops::unban_user(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::SetMemberRole(req) => {
				let ack = result_ack(ops::set_member_role(deps, user, &req).await);
				send_ack(control_send, request_id, ack).await?;
			}

			pb::envelope::Msg::Ping(ping) => {
				send_envelope(
					control_send,
					convert::envelope(
						request_id,
						pb::envelope::Msg::Pong(pb::Pong {
							client_time_unix_ms: ping.client_time_unix_ms,
							server_time_unix_ms: unix_ms_now(),
						}),
					),
				)
				.await?;
			}

			pb::envelope::Msg::Hello(_) => {
				debug!(conn_id, "ignoring duplicate Hello");
			}

			other => {
				warn!(conn_id, "unhandled control message: {:?}", other);
			}
		}
	}

	Ok(())
}

fn result_ack(result: Result<(), wayfarer_domain::ChatError>) -> pb::Ack {
	match result {
		Ok(()) => convert::ack_success(),
		Err(e) => convert::ack_failure(&e),
	}
}

async fn send_ack(send: &mut quinn::SendStream, request_id: String, ack: pb::Ack) -> anyhow::Result<()> {
	send_envelope(send, convert::envelope(request_id, pb::envelope::Msg::Ack(ack))).await
}

/// Wire this connection's fan-out for a room: a forwarder task drains the
/// hub subscription into the session's events writer.
async fn subscribe_conn(
	deps: &Arc<ChatDeps>,
	conn_id: u64,
	room: RoomId,
	fan_in_tx: &mpsc::Sender<RoomHubItem>,
	forwarders: &mut HashMap<RoomId, JoinHandle<()>>,
) {
	deps.state.write().await.subscribe(conn_id, room.clone());

	if forwarders.contains_key(&room) {
		return;
	}

	let mut rx = deps.hub.subscribe(room.clone(), conn_id).await;
	let tx = fan_in_tx.clone();
	let handle = tokio::spawn(async move {
		while let Some(item) = rx.recv().await {
			if tx.send(item).await.is_err() {
				break;
			}
		}
	});

	if let Some(old) = forwarders.insert(room, handle) {
		old.abort();
	}
}

async fn unsubscribe_conn(
	deps: &Arc<ChatDeps>,
	conn_id: u64,
	room: &RoomId,
	forwarders: &mut HashMap<RoomId, JoinHandle<()>>,
) {
	deps.state.write().await.unsubscribe(conn_id, room);
	deps.hub.unsubscribe(room, conn_id).await;
	if let Some(handle) = forwarders.remove(room) {
		handle.abort();
	}
}

/// Presence change fan-out to every room the user is a member of.
async fn broadcast_status(deps: &Arc<ChatDeps>, conn_id: u64, user: &UserIdentity, online: bool) {
	let rooms = match deps.rooms.rooms_for_member(&user.id).await {
		Ok(rooms) => rooms,
		Err(e) => {
			warn!(user = %user.id, error = %e, "failed to list rooms for status broadcast");
			return;
		}
	};

	let view = ops::identity_to_wire(user, online);
	for (room_id, _) in rooms {
		deps.hub
			.publish(
				&room_id,
				ops::event_envelope(
					&room_id,
					pb::event_envelope::Event::UserStatusChange(pb::UserStatusChangeEvent {
						user: Some(view.clone()),
					}),
				),
				Some(conn_id),
			)
			.await;
	}
}

fn spawn_control_reader(
	conn_id: u64,
	mut control_recv: quinn::RecvStream,
	ctrl_tx: mpsc::UnboundedSender<pb::Envelope>,
) -> JoinHandle<anyhow::Result<()>> {
	tokio::spawn(async move {
		let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("wayfarer_server_control_bytes_in_total").increment(n as u64);
			decoder.extend(&tmp[..n]);

			loop {
				match decoder.next_frame::<pb::Envelope>() {
					Ok(Some(env)) => {
						metrics::counter!("wayfarer_server_envelopes_in_total").increment(1);
						if ctrl_tx.send(env).is_err() {
							return Ok(());
						}
					}
					Ok(None) => break,
					Err(e) => {
						metrics::counter!("wayfarer_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context(format!("failed to decode control frame (conn {conn_id})")));
					}
				}
			}
		}
	})
}

/// Forward broadcast events onto the client-opened events stream. The
/// client opens the stream right after the handshake and writes one
/// activation byte so the server observes it promptly.
async fn run_events_writer(
	conn_id: u64,
	connection: quinn::Connection,
	mut fan_in_rx: mpsc::Receiver<RoomHubItem>,
) -> anyhow::Result<()> {
	let (mut events_send, mut events_recv) = connection.accept_bi().await.context("accept events stream")?;

	let mut activation = [0u8; 1];
	let _ = events_recv.read(&mut activation).await;
	debug!(conn_id, "events stream open");

	while let Some(item) = fan_in_rx.recv().await {
		match item {
			RoomHubItem::Event(env) => {
				let frame = encode_frame(
					&convert::envelope(String::new(), pb::envelope::Msg::Event(*env)),
					DEFAULT_MAX_FRAME_SIZE,
				)?;
				metrics::counter!("wayfarer_server_events_out_total").increment(1);
				events_send.write_all(&frame).await.context("events stream write failed")?;
			}
			RoomHubItem::Lagged { dropped } => {
				metrics::counter!("wayfarer_server_events_lagged_total").increment(dropped);
				warn!(conn_id, dropped, "session fan-out lagged; events dropped");
			}
		}
	}

	Ok(())
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		let Some(msg) = env.msg else { continue };
		if let pb::envelope::Msg::Hello(h) = msg {
			return Ok(h);
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

async fn send_envelope(send: &mut quinn::SendStream, env: pb::Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("wayfarer_server_envelopes_out_total").increment(1);
	metrics::counter!("wayfarer_server_control_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("control stream write")?;
	Ok(())
}
