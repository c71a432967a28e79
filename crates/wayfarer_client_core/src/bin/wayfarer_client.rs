#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{info, warn};
use wayfarer_client_core::{ChatClient, ChatEvent, ClientConfig, EventKind};
use wayfarer_domain::MessageKind;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: wayfarer_client --token <token> [--connect quic://host:port] [--room room]\n\
\n\
Options:\n\
\t--connect  Server endpoint (default: quic://127.0.0.1:18421)\n\
\t           Format: quic://host:port\n\
\t--token    Bearer token for the handshake (required)\n\
\t--room     Room to join on connect (repeatable; default: general)\n\
\t--help     Show this help\n\
\n\
Once connected, lines typed on stdin are sent to the first joined room.\n\
\n\
Examples:\n\
\twayfarer_client --token $TOKEN --room general\n\
\twayfarer_client --connect quic://chat.wayfarer.example:443 --token $TOKEN --room alps --room beaches\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wayfarer_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	token: String,
	rooms: Vec<String>,
}

fn parse_args() -> Args {
	let mut endpoint = "quic://127.0.0.1:18421".to_string();
	let mut token: Option<String> = None;
	let mut rooms: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--token must be non-empty");
					usage_and_exit();
				}
				token = Some(v);
			}
			"--room" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--room must be non-empty");
					usage_and_exit();
				}
				rooms.push(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(token) = token else {
		eprintln!("--token is required");
		usage_and_exit();
	};

	if rooms.is_empty() {
		rooms.push("general".to_string());
	}

	Args { endpoint, token, rooms }
}

fn print_event(event: &ChatEvent) {
	match event {
		ChatEvent::NewMessage(m) => {
			let sender = m.sender.as_ref().map(|u| u.display_name.as_str()).unwrap_or("?");
			println!("[{}] {sender}: {}", m.room_id, m.content);
		}
		ChatEvent::UserJoined { room_id, user } => {
			println!("[{room_id}] * {} joined", user.display_name);
		}
		ChatEvent::UserLeft { room_id, user } => {
			println!("[{room_id}] * {} left", user.display_name);
		}
		ChatEvent::Typing { room_id, user_id } => {
			println!("[{room_id}] * {user_id} is typing...");
		}
		ChatEvent::StatusChange(user) => {
			let state = if user.online { "online" } else { "offline" };
			println!("* {} is now {state}", user.display_name);
		}
		ChatEvent::ReactionAdded {
			room_id,
			message_id,
			reaction,
		} => {
			println!("[{room_id}] * {} reacted {} to {message_id}", reaction.user_id, reaction.emoji);
		}
		ChatEvent::MessageDeleted { room_id, message_id } => {
			println!("[{room_id}] * message {message_id} deleted");
		}
		ChatEvent::MessageModerated {
			room_id,
			message_id,
			moderated_by,
			..
		} => {
			println!("[{room_id}] * message {message_id} moderated by {moderated_by}");
		}
		ChatEvent::MessagePinToggled {
			room_id,
			message_id,
			pinned,
		} => {
			let what = if *pinned { "pinned" } else { "unpinned" };
			println!("[{room_id}] * message {message_id} {what}");
		}
		ChatEvent::Reconnecting { attempt, next_retry_in_ms } => {
			println!("* reconnecting (attempt {attempt}, next retry in {next_retry_in_ms}ms)");
		}
		ChatEvent::ConnectionLost { attempts } => {
			println!("* connection lost after {attempts} attempts; reconnect manually");
		}
		ChatEvent::Disconnected { reason } => {
			println!("* disconnected: {reason}");
		}
		other => {
			println!("* {other:?}");
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	init_tracing();

	let args = parse_args();
	let cfg = ClientConfig::from_quic_endpoint(&args.endpoint)?;

	let client = ChatClient::new(cfg);

	for kind in [
		EventKind::NewMessage,
		EventKind::UserJoined,
		EventKind::UserLeft,
		EventKind::Typing,
		EventKind::StatusChange,
		EventKind::ReactionAdded,
		EventKind::MessageDeleted,
		EventKind::MessageModerated,
		EventKind::MessagePinToggled,
		EventKind::Reconnecting,
		EventKind::ConnectionLost,
		EventKind::Disconnected,
	] {
		client.subscribe(kind, Arc::new(print_event));
	}

	info!(endpoint = %args.endpoint, "connecting");
	client.connect(args.token.clone()).await?;
	info!("connected");

	for room in &args.rooms {
		match client.join_room(room.clone()).await {
			Ok(joined) => {
				info!(room = %room, members = joined.room.members.len(), "joined");
				for message in &joined.messages {
					print_event(&ChatEvent::NewMessage(message.clone()));
				}
			}
			Err(e) => warn!(room = %room, error = %e, "join failed"),
		}
	}

	let home_room = args.rooms[0].clone();
	println!("(type to chat in [{home_room}]; Ctrl-D to quit)");

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	while let Some(line) = lines.next_line().await? {
		let line = line.trim().to_string();
		if line.is_empty() {
			continue;
		}
		if let Err(e) = client.send_message(home_room.clone(), line, MessageKind::Text, None).await {
			warn!(error = %e, "send failed");
		}
	}

	client.disconnect().await.ok();
	Ok(())
}
