#![forbid(unsafe_code)]

//! The connection driver: a single task that owns all connection state.
//!
//! There is exactly one slot for an in-flight connect attempt and one for an
//! in-flight token refresh; callers that arrive while either is outstanding
//! attach to it instead of starting their own. That structure is what makes
//! the single-flight guarantees hold without boolean lock flags.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tracing::{debug, info, warn};
use wayfarer_protocol::pb;
use wayfarer_util::time::unix_ms_now;

use crate::api::{BoxedSession, ConnectError, ConnectOutcome, ConnectParams, SessionFactory, SessionNotice};
use crate::backoff::backoff_delay;
use crate::subscriptions::{ChatEvent, Subscriptions};
use crate::{ClientConfig, ClientError, TokenRefreshFn};

/// Requests queued while a connect/refresh is in flight.
const MAX_QUEUED_REQUESTS: usize = 256;

pub(crate) enum Command {
	Connect {
		token: String,
		reply: oneshot::Sender<Result<(), ClientError>>,
	},
	Disconnect {
		reply: oneshot::Sender<()>,
	},
	SetRefresh {
		refresh: TokenRefreshFn,
	},
	Request {
		msg: pb::envelope::Msg,
		timeout: Duration,
		reply: oneshot::Sender<Result<pb::envelope::Msg, ClientError>>,
	},
	Fire {
		msg: pb::envelope::Msg,
	},
}

enum Internal {
	ConnectDone(Result<ConnectOutcome, ConnectError>),
	RefreshDone(Result<String, String>),
	PingResult { ok: bool },
}

/// The single current-operation slot.
enum ConnPhase {
	Disconnected,
	/// A connect attempt is in flight (or scheduled via backoff).
	Connecting,
	Connected(BoxedSession),
	/// A token refresh is in flight; connects and requests wait behind it.
	Refreshing,
}

struct QueuedRequest {
	msg: pb::envelope::Msg,
	timeout: Duration,
	reply: oneshot::Sender<Result<pb::envelope::Msg, ClientError>>,
}

struct Driver {
	cfg: ClientConfig,
	subs: Arc<Subscriptions>,
	factory: SessionFactory,
	internal_tx: mpsc::Sender<Internal>,

	phase: ConnPhase,
	token: Option<String>,
	waiters: Vec<oneshot::Sender<Result<(), ClientError>>>,
	queued: VecDeque<QueuedRequest>,
	queued_fires: VecDeque<pb::envelope::Msg>,
	refresh_cb: Option<TokenRefreshFn>,
	attempt: u32,
	reconnect_deadline: Option<Instant>,
	disconnect_requested: bool,
	notices: Option<mpsc::Receiver<SessionNotice>>,
	attempt_task: Option<JoinHandle<()>>,
	refresh_task: Option<JoinHandle<()>>,
	keepalive_failures: u32,
}

pub(crate) async fn run_driver(
	cfg: ClientConfig,
	mut cmd_rx: mpsc::Receiver<Command>,
	subs: Arc<Subscriptions>,
	factory: SessionFactory,
) {
	let (internal_tx, mut internal_rx) = mpsc::channel::<Internal>(64);

	let mut keepalive_tick = tokio::time::interval(cfg.keepalive_interval);
	keepalive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

	let mut d = Driver {
		cfg,
		subs,
		factory,
		internal_tx,
		phase: ConnPhase::Disconnected,
		token: None,
		waiters: Vec::new(),
		queued: VecDeque::new(),
		queued_fires: VecDeque::new(),
		refresh_cb: None,
		attempt: 0,
		reconnect_deadline: None,
		disconnect_requested: false,
		notices: None,
		attempt_task: None,
		refresh_task: None,
		keepalive_failures: 0,
	};

	loop {
		tokio::select! {
			cmd = cmd_rx.recv() => {
				let Some(cmd) = cmd else {
					d.shutdown("client dropped");
					break;
				};
				d.handle_command(cmd);
			}

			Some(internal) = internal_rx.recv() => {
				d.handle_internal(internal);
			}

			// Pends forever while no session is live.
			notice = recv_notice(&mut d.notices) => {
				d.handle_notice(notice);
			}

			_ = keepalive_tick.tick(), if matches!(d.phase, ConnPhase::Connected(_)) => {
				d.spawn_keepalive_ping();
			}

			_ = wait_deadline(d.reconnect_deadline), if d.reconnect_deadline.is_some() => {
				d.reconnect_deadline = None;
				if let Some(token) = d.token.clone() {
					debug!(attempt = d.attempt, "reconnect timer fired");
					d.start_attempt(token);
				}
			}
		}
	}
}

async fn recv_notice(notices: &mut Option<mpsc::Receiver<SessionNotice>>) -> Option<SessionNotice> {
	match notices.as_mut() {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}

async fn wait_deadline(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

fn spawn_request(
	session: BoxedSession,
	msg: pb::envelope::Msg,
	timeout: Duration,
	reply: oneshot::Sender<Result<pb::envelope::Msg, ClientError>>,
) {
	tokio::spawn(async move {
		let _ = reply.send(session.request(msg, timeout).await);
	});
}

impl Driver {
	fn handle_command(&mut self, cmd: Command) {
		match cmd {
			Command::Connect { token, reply } => {
				self.disconnect_requested = false;
				match &self.phase {
					ConnPhase::Connected(session) => {
						if self.token.as_deref() == Some(token.as_str()) {
							// Reusing a live session with the same token is
							// a no-op success.
							let _ = reply.send(Ok(()));
						} else {
							info!("connect with a new token; tearing down the old transport");
							session.close(0, "reconnect with new token");
							self.notices = None;
							self.attempt = 0;
							self.reconnect_deadline = None;
							self.waiters.push(reply);
							self.start_attempt(token);
						}
					}
					ConnPhase::Connecting | ConnPhase::Refreshing => {
						// Coalesce: attach to the in-flight attempt.
						self.waiters.push(reply);
					}
					ConnPhase::Disconnected => {
						self.attempt = 0;
						self.reconnect_deadline = None;
						self.waiters.push(reply);
						self.start_attempt(token);
					}
				}
			}

			Command::Disconnect { reply } => {
				self.disconnect_requested = true;
				self.reconnect_deadline = None;
				self.attempt = 0;
				self.keepalive_failures = 0;
				if let Some(t) = self.attempt_task.take() {
					t.abort();
				}
				if let Some(t) = self.refresh_task.take() {
					t.abort();
				}
				if let ConnPhase::Connected(session) = &self.phase {
					session.close(0, "disconnect requested");
				}
				self.notices = None;
				self.fail_pending(ClientError::Closed("disconnect requested".to_string()));
				self.phase = ConnPhase::Disconnected;
				self.subs.dispatch(&ChatEvent::Disconnected {
					reason: "disconnect requested".to_string(),
				});
				let _ = reply.send(());
			}

			Command::SetRefresh { refresh } => {
				self.refresh_cb = Some(refresh);
			}

			Command::Request { msg, timeout, reply } => match &self.phase {
				ConnPhase::Connected(session) => spawn_request(Arc::clone(session), msg, timeout, reply),
				ConnPhase::Connecting | ConnPhase::Refreshing => {
					if self.queued.len() >= MAX_QUEUED_REQUESTS {
						let _ = reply.send(Err(ClientError::Transport("request queue full".to_string())));
					} else {
						self.queued.push_back(QueuedRequest { msg, timeout, reply });
					}
				}
				ConnPhase::Disconnected => {
					let _ = reply.send(Err(ClientError::Transport("not connected".to_string())));
				}
			},

			Command::Fire { msg } => match &self.phase {
				ConnPhase::Connected(session) => {
					let session = Arc::clone(session);
					tokio::spawn(async move {
						if let Err(e) = session.fire(msg).await {
							debug!(error = %e, "fire-and-forget send failed");
						}
					});
				}
				ConnPhase::Connecting | ConnPhase::Refreshing => {
					if self.queued_fires.len() < MAX_QUEUED_REQUESTS {
						self.queued_fires.push_back(msg);
					}
				}
				ConnPhase::Disconnected => {}
			},
		}
	}

	fn handle_internal(&mut self, internal: Internal) {
		match internal {
			Internal::ConnectDone(result) => {
				self.attempt_task = None;

				if self.disconnect_requested {
					if let Ok(outcome) = result {
						outcome.session.close(0, "disconnect requested");
					}
					return;
				}
				if !matches!(self.phase, ConnPhase::Connecting) {
					return;
				}

				match result {
					Ok(outcome) => {
						info!(server = %outcome.welcome.server_name, "connected");
						self.attempt = 0;
						self.reconnect_deadline = None;
						self.keepalive_failures = 0;
						self.notices = Some(outcome.notices);

						let session = outcome.session;
						for w in self.waiters.drain(..) {
							let _ = w.send(Ok(()));
						}
						while let Some(q) = self.queued.pop_front() {
							spawn_request(Arc::clone(&session), q.msg, q.timeout, q.reply);
						}
						while let Some(msg) = self.queued_fires.pop_front() {
							let s = Arc::clone(&session);
							tokio::spawn(async move {
								let _ = s.fire(msg).await;
							});
						}

						self.subs.dispatch(&ChatEvent::Connected {
							server_name: outcome.welcome.server_name,
						});
						self.phase = ConnPhase::Connected(session);
					}
					Err(ConnectError::Auth { code, message }) => {
						self.handle_auth_failure(code, message);
					}
					Err(ConnectError::Transport(message)) => {
						warn!(error = %message, "connect attempt failed");
						self.schedule_reconnect();
					}
				}
			}

			Internal::RefreshDone(result) => {
				self.refresh_task = None;
				if self.disconnect_requested || !matches!(self.phase, ConnPhase::Refreshing) {
					return;
				}

				match result {
					Ok(new_token) => {
						info!("token refresh succeeded; reconnecting");
						self.start_attempt(new_token);
					}
					Err(e) => {
						warn!(error = %e, "token refresh failed");
						self.fail_pending(ClientError::Auth {
							code: "refresh-failed".to_string(),
							message: e,
						});
						self.phase = ConnPhase::Disconnected;
						self.subs.dispatch(&ChatEvent::Disconnected {
							reason: "token refresh failed".to_string(),
						});
					}
				}
			}

			Internal::PingResult { ok } => {
				if ok {
					self.keepalive_failures = 0;
					return;
				}
				if !matches!(self.phase, ConnPhase::Connected(_)) {
					return;
				}

				self.keepalive_failures = self.keepalive_failures.saturating_add(1);
				warn!(failures = self.keepalive_failures, "keepalive failed");

				if self.keepalive_failures >= self.cfg.keepalive_max_failures {
					if let ConnPhase::Connected(session) = &self.phase {
						session.close(0, "keepalive failed");
					}
					self.notices = None;
					self.keepalive_failures = 0;
					self.subs.dispatch(&ChatEvent::Disconnected {
						reason: "keepalive failed".to_string(),
					});
					self.schedule_reconnect();
				}
			}
		}
	}

	fn handle_notice(&mut self, notice: Option<SessionNotice>) {
		match notice {
			Some(SessionNotice::Event(env)) => {
				if let Some(event) = ChatEvent::from_envelope(*env) {
					self.subs.dispatch(&event);
				}
			}

			Some(SessionNotice::AuthError { code, message }) => {
				// A second auth failure arriving while a refresh is already
				// outstanding queues behind it by doing nothing here.
				if matches!(self.phase, ConnPhase::Refreshing) {
					debug!(code = %code, "auth failure while refresh in flight; coalesced");
					return;
				}
				if let ConnPhase::Connected(session) = &self.phase {
					session.close(0, "authentication expired");
				}
				self.notices = None;
				self.handle_auth_failure(code, message);
			}

			Some(SessionNotice::Closed(reason)) => self.on_transport_closed(reason),
			None => self.on_transport_closed("session channel closed".to_string()),
		}
	}

	fn on_transport_closed(&mut self, reason: String) {
		self.notices = None;
		if self.disconnect_requested || !matches!(self.phase, ConnPhase::Connected(_)) {
			return;
		}

		info!(reason = %reason, "transport lost");
		self.subs.dispatch(&ChatEvent::Disconnected { reason });
		self.schedule_reconnect();
	}

	/// Auth failures during connect or on an active session: run the
	/// caller-supplied refresh at most once concurrently, or surface the
	/// failure if no refresh is registered (or the account is deactivated).
	fn handle_auth_failure(&mut self, code: String, message: String) {
		let refreshable = matches!(code.as_str(), "expired" | "invalid" | "no-token");

		if refreshable && let Some(cb) = self.refresh_cb.clone() {
			info!(code = %code, "authentication failure; invoking token refresh");
			self.phase = ConnPhase::Refreshing;
			let tx = self.internal_tx.clone();
			self.refresh_task = Some(tokio::spawn(async move {
				let result = cb().await;
				let _ = tx.send(Internal::RefreshDone(result)).await;
			}));
			return;
		}

		warn!(code = %code, message = %message, "authentication failed");
		self.fail_pending(ClientError::Auth { code, message });
		self.phase = ConnPhase::Disconnected;
		self.subs.dispatch(&ChatEvent::Disconnected {
			reason: "authentication failed".to_string(),
		});
	}

	/// Exponential backoff with jitter; exceeding the retry budget surfaces
	/// a terminal error and resets the counter so a later manual connect
	/// starts fresh.
	fn schedule_reconnect(&mut self) {
		self.attempt = self.attempt.saturating_add(1);

		if self.attempt > self.cfg.backoff.max_attempts {
			let attempts = self.cfg.backoff.max_attempts;
			warn!(attempts, "reconnect attempts exhausted");
			self.fail_pending(ClientError::RetriesExhausted { attempts });
			self.attempt = 0;
			self.reconnect_deadline = None;
			self.phase = ConnPhase::Disconnected;
			self.subs.dispatch(&ChatEvent::ConnectionLost { attempts });
			return;
		}

		let delay = backoff_delay(self.attempt, &self.cfg.backoff);
		debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
		self.reconnect_deadline = Some(Instant::now() + delay);
		self.phase = ConnPhase::Connecting;
		self.subs.dispatch(&ChatEvent::Reconnecting {
			attempt: self.attempt,
			next_retry_in_ms: delay.as_millis() as u64,
		});
	}

	/// Fire the factory exactly once for this attempt; the outcome arrives
	/// back through the internal channel.
	fn start_attempt(&mut self, token: String) {
		self.token = Some(token.clone());
		self.phase = ConnPhase::Connecting;

		let fut = (self.factory)(ConnectParams {
			cfg: self.cfg.clone(),
			token,
		});
		let tx = self.internal_tx.clone();
		self.attempt_task = Some(tokio::spawn(async move {
			let result = fut.await;
			let _ = tx.send(Internal::ConnectDone(result)).await;
		}));
	}

	fn spawn_keepalive_ping(&self) {
		let ConnPhase::Connected(session) = &self.phase else {
			return;
		};
		let session = Arc::clone(session);
		let tx = self.internal_tx.clone();
		let timeout = self.cfg.keepalive_timeout;
		tokio::spawn(async move {
			let ok = matches!(
				session
					.request(
						pb::envelope::Msg::Ping(pb::Ping {
							client_time_unix_ms: unix_ms_now(),
						}),
						timeout,
					)
					.await,
				Ok(pb::envelope::Msg::Pong(_))
			);
			let _ = tx.send(Internal::PingResult { ok }).await;
		});
	}

	fn fail_pending(&mut self, err: ClientError) {
		for w in self.waiters.drain(..) {
			let _ = w.send(Err(err.clone()));
		}
		while let Some(q) = self.queued.pop_front() {
			let _ = q.reply.send(Err(err.clone()));
		}
		self.queued_fires.clear();
	}

	fn shutdown(&mut self, reason: &str) {
		if let ConnPhase::Connected(session) = &self.phase {
			session.close(0, reason);
		}
		if let Some(t) = self.attempt_task.take() {
			t.abort();
		}
		if let Some(t) = self.refresh_task.take() {
			t.abort();
		}
		self.fail_pending(ClientError::Closed(reason.to_string()));
	}
}
