#![forbid(unsafe_code)]

//! QUIC transport session: connect + handshake, request/ack correlation,
//! and the events-stream reader.

use std::collections::HashMap;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs as _};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quinn::{ClientConfig as QuinnClientConfig, Endpoint, TransportConfig, VarInt};
use tokio::io::AsyncWriteExt as _;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use wayfarer_protocol::framing::{FrameDecoder, encode_frame};
use wayfarer_protocol::{convert, pb};

use crate::api::{ConnectError, ConnectOutcome, ConnectParams, SessionApi, SessionNotice};
use crate::{ClientConfig, ClientError};

const NOTICE_CAPACITY: usize = 256;
const WRITER_CAPACITY: usize = 64;

/// Connect, handshake, and wire up the session tasks.
pub async fn connect_quic(params: ConnectParams) -> Result<ConnectOutcome, ConnectError> {
	let cfg = params.cfg;
	let endpoint = make_client_endpoint().map_err(ConnectError::Transport)?;
	let quinn_cfg = make_insecure_client_config().map_err(ConnectError::Transport)?;

	let server_name = cfg.server_host.clone();
	let candidates = resolve_candidates(&cfg)?;

	let mut last_err: Option<String> = None;
	let mut conn: Option<quinn::Connection> = None;

	for server_addr in candidates {
		let connecting = endpoint
			.connect_with(quinn_cfg.clone(), server_addr, &server_name)
			.map_err(|e| ConnectError::Transport(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

		match tokio::time::timeout(cfg.connect_timeout, connecting).await {
			Ok(Ok(c)) => {
				conn = Some(c);
				break;
			}
			Ok(Err(e)) => {
				last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
			}
			Err(_) => {
				last_err = Some(format!(
					"connect timeout after {:?} (addr={server_addr}, sni={server_name})",
					cfg.connect_timeout
				));
			}
		}
	}

	let conn = conn.ok_or_else(|| {
		ConnectError::Transport(last_err.unwrap_or_else(|| format!("connect failed (sni={server_name})")))
	})?;

	info!(remote = %conn.remote_address(), "transport connected");

	let (mut control_send, mut control_recv) = tokio::time::timeout(cfg.connect_timeout, conn.open_bi())
		.await
		.map_err(|_| ConnectError::Transport("timeout opening control stream".to_string()))?
		.map_err(|e| ConnectError::Transport(format!("open_bi(control) failed: {e}")))?;

	// Token is presented at connect time, not after.
	let hello = convert::envelope(
		String::new(),
		pb::envelope::Msg::Hello(pb::Hello {
			token: params.token,
			client_name: cfg.client_name.clone(),
			client_instance_id: cfg.client_instance_id.clone(),
		}),
	);
	write_envelope(&mut control_send, &hello, cfg.max_frame_bytes)
		.await
		.map_err(|e| ConnectError::Transport(format!("send Hello failed: {e}")))?;

	let reply = tokio::time::timeout(cfg.connect_timeout, read_one_envelope(&mut control_recv, cfg.max_frame_bytes))
		.await
		.map_err(|_| ConnectError::Transport("timeout waiting for Welcome".to_string()))?
		.map_err(ConnectError::Transport)?;

	let welcome = match reply.msg {
		Some(pb::envelope::Msg::Welcome(w)) => w,
		Some(pb::envelope::Msg::Error(e)) => {
			return Err(ConnectError::Auth {
				code: e.code,
				message: e.message,
			});
		}
		other => {
			return Err(ConnectError::Transport(format!("expected Welcome, got {other:?}")));
		}
	};

	debug!(
		server_name = %welcome.server_name,
		server_instance_id = %welcome.server_instance_id,
		max_frame_bytes = welcome.max_frame_bytes,
		"received Welcome"
	);

	let max_frame_bytes = (welcome.max_frame_bytes as usize).min(cfg.max_frame_bytes).max(4096);

	// Open the events stream right away; an activation byte forces a STREAM
	// frame so the server observes it promptly.
	let (mut events_send, events_recv) = conn
		.open_bi()
		.await
		.map_err(|e| ConnectError::Transport(format!("open_bi(events) failed: {e}")))?;
	events_send
		.write_all(&[0u8])
		.await
		.map_err(|e| ConnectError::Transport(format!("events stream activation failed: {e}")))?;
	events_send
		.flush()
		.await
		.map_err(|e| ConnectError::Transport(format!("events stream flush failed: {e}")))?;

	let (notice_tx, notice_rx) = mpsc::channel::<SessionNotice>(NOTICE_CAPACITY);
	let (writer_tx, writer_rx) = mpsc::channel::<pb::Envelope>(WRITER_CAPACITY);
	let pending: Arc<Mutex<HashMap<String, oneshot::Sender<pb::envelope::Msg>>>> = Arc::new(Mutex::new(HashMap::new()));

	tokio::spawn(run_writer(control_send, writer_rx, max_frame_bytes));
	tokio::spawn(run_control_reader(
		control_recv,
		Arc::clone(&pending),
		notice_tx.clone(),
		max_frame_bytes,
	));
	tokio::spawn(run_events_reader(events_recv, events_send, notice_tx, max_frame_bytes));

	let session = Arc::new(WireSession {
		conn,
		writer_tx,
		pending,
		next_request_id: AtomicU64::new(0),
	});

	Ok(ConnectOutcome {
		session,
		welcome,
		notices: notice_rx,
	})
}

/// Live QUIC session handle shared by the driver and spawned request tasks.
pub struct WireSession {
	conn: quinn::Connection,
	writer_tx: mpsc::Sender<pb::Envelope>,
	pending: Arc<Mutex<HashMap<String, oneshot::Sender<pb::envelope::Msg>>>>,
	next_request_id: AtomicU64,
}

impl WireSession {
	fn next_request_id(&self) -> String {
		format!("r{}", self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1)
	}

	fn detach(&self, request_id: &str) {
		if let Ok(mut pending) = self.pending.lock() {
			pending.remove(request_id);
		}
	}
}

impl SessionApi for WireSession {
	fn request<'a>(
		&'a self,
		msg: pb::envelope::Msg,
		timeout: Duration,
	) -> Pin<Box<dyn Future<Output = Result<pb::envelope::Msg, ClientError>> + Send + 'a>> {
		Box::pin(async move {
			let request_id = self.next_request_id();

			let (tx, rx) = oneshot::channel();
			{
				let mut pending = self
					.pending
					.lock()
					.map_err(|_| ClientError::Transport("pending map poisoned".to_string()))?;
				pending.insert(request_id.clone(), tx);
			}

			let env = convert::envelope(request_id.clone(), msg);
			if self.writer_tx.send(env).await.is_err() {
				self.detach(&request_id);
				return Err(ClientError::Transport("connection closed".to_string()));
			}

			match tokio::time::timeout(timeout, rx).await {
				Ok(Ok(msg)) => Ok(msg),
				Ok(Err(_)) => {
					self.detach(&request_id);
					Err(ClientError::Transport("connection closed".to_string()))
				}
				Err(_) => {
					// Detach the listener so the late ack finds nothing.
					self.detach(&request_id);
					Err(ClientError::Timeout(format!("request {request_id} timed out after {timeout:?}")))
				}
			}
		})
	}

	fn fire<'a>(&'a self, msg: pb::envelope::Msg) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>> {
		Box::pin(async move {
			let env = convert::envelope(String::new(), msg);
			self.writer_tx
				.send(env)
				.await
				.map_err(|_| ClientError::Transport("connection closed".to_string()))
		})
	}

	fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}
}

async fn run_writer(mut send: quinn::SendStream, mut rx: mpsc::Receiver<pb::Envelope>, max_frame_bytes: usize) {
	while let Some(env) = rx.recv().await {
		let frame = match encode_frame(&env, max_frame_bytes) {
			Ok(f) => f,
			Err(e) => {
				warn!(error = %e, "dropping oversized outbound frame");
				continue;
			}
		};
		if send.write_all(&frame).await.is_err() {
			break;
		}
		if send.flush().await.is_err() {
			break;
		}
	}
}

/// Route correlated responses to their pending listeners; surface
/// non-correlated auth errors to the driver.
async fn run_control_reader(
	mut recv: quinn::RecvStream,
	pending: Arc<Mutex<HashMap<String, oneshot::Sender<pb::envelope::Msg>>>>,
	notice_tx: mpsc::Sender<SessionNotice>,
	max_frame_bytes: usize,
) {
	let mut decoder = FrameDecoder::new(max_frame_bytes);
	let mut tmp = [0u8; 8192];

	let reason = loop {
		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => break "control stream closed".to_string(),
			Err(e) => break format!("control stream read failed: {e}"),
		};
		decoder.extend(&tmp[..n]);

		loop {
			match decoder.next_frame::<pb::Envelope>() {
				Ok(Some(env)) => route_control_envelope(env, &pending, &notice_tx).await,
				Ok(None) => break,
				Err(e) => {
					let _ = notice_tx
						.send(SessionNotice::Closed(format!("control frame decode failed: {e}")))
						.await;
					return;
				}
			}
		}
	};

	// Pending listeners learn about the close by their senders dropping.
	if let Ok(mut pending) = pending.lock() {
		pending.clear();
	}
	let _ = notice_tx.send(SessionNotice::Closed(reason)).await;
}

async fn route_control_envelope(
	env: pb::Envelope,
	pending: &Arc<Mutex<HashMap<String, oneshot::Sender<pb::envelope::Msg>>>>,
	notice_tx: &mpsc::Sender<SessionNotice>,
) {
	let Some(msg) = env.msg else { return };

	if !env.request_id.is_empty() {
		let listener = pending.lock().ok().and_then(|mut p| p.remove(&env.request_id));
		match listener {
			// A timed-out request already detached its listener; the late
			// response is dropped on the floor.
			None => debug!(request_id = %env.request_id, "no pending listener for response"),
			Some(tx) => {
				let _ = tx.send(msg);
			}
		}
		return;
	}

	match msg {
		pb::envelope::Msg::Error(e) => {
			warn!(code = %e.code, message = %e.message, "server reported session error");
			let _ = notice_tx
				.send(SessionNotice::AuthError {
					code: e.code,
					message: e.message,
				})
				.await;
		}
		other => debug!("ignoring non-correlated control message: {other:?}"),
	}
}

/// Decode broadcast events until EOF or error.
async fn run_events_reader(
	mut recv: quinn::RecvStream,
	// Keep the send half alive so the peer doesn't see an immediate FIN.
	_events_send_keepalive: quinn::SendStream,
	notice_tx: mpsc::Sender<SessionNotice>,
	max_frame_bytes: usize,
) {
	let mut decoder = FrameDecoder::new(max_frame_bytes);
	let mut tmp = [0u8; 8192];

	let reason = loop {
		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => break "events stream closed".to_string(),
			Err(e) => break format!("events stream read failed: {e}"),
		};
		decoder.extend(&tmp[..n]);

		loop {
			match decoder.next_frame::<pb::Envelope>() {
				Ok(Some(env)) => {
					if let Some(pb::envelope::Msg::Event(event)) = env.msg {
						if notice_tx.send(SessionNotice::Event(Box::new(event))).await.is_err() {
							return;
						}
					} else {
						debug!("unexpected message on events stream");
					}
				}
				Ok(None) => break,
				Err(e) => {
					let _ = notice_tx
						.send(SessionNotice::Closed(format!("events frame decode failed: {e}")))
						.await;
					return;
				}
			}
		}
	};

	let _ = notice_tx.send(SessionNotice::Closed(reason)).await;
}

fn resolve_candidates(cfg: &ClientConfig) -> Result<Vec<SocketAddr>, ConnectError> {
	match cfg.server_addr {
		Some(addr) => Ok(vec![addr]),
		None => {
			let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
			let addrs: Vec<SocketAddr> = hostport
				.to_socket_addrs()
				.map_err(|e| ConnectError::Transport(format!("failed to resolve {hostport}: {e}")))?
				.collect();
			if addrs.is_empty() {
				return Err(ConnectError::Transport(format!(
					"DNS resolution returned no addresses for {hostport}"
				)));
			}
			Ok(addrs)
		}
	}
}

async fn write_envelope(send: &mut quinn::SendStream, env: &pb::Envelope, max_frame_bytes: usize) -> Result<(), String> {
	let frame = encode_frame(env, max_frame_bytes).map_err(|e| e.to_string())?;
	send.write_all(&frame).await.map_err(|e| e.to_string())?;
	send.flush().await.map_err(|e| e.to_string())?;
	Ok(())
}

async fn read_one_envelope(recv: &mut quinn::RecvStream, max_frame_bytes: usize) -> Result<pb::Envelope, String> {
	let mut decoder = FrameDecoder::new(max_frame_bytes);
	let mut tmp = [0u8; 8192];

	loop {
		if let Some(env) = decoder.next_frame::<pb::Envelope>().map_err(|e| e.to_string())? {
			return Ok(env);
		}

		let n = match recv.read(&mut tmp).await {
			Ok(Some(n)) => n,
			Ok(None) => return Err("stream closed before receiving full message".to_string()),
			Err(e) => return Err(e.to_string()),
		};
		decoder.extend(&tmp[..n]);
	}
}

fn make_client_endpoint() -> Result<Endpoint, String> {
	let addr: SocketAddr = "0.0.0.0:0".parse().map_err(|e| format!("bind addr: {e}"))?;
	Endpoint::client(addr).map_err(|e| format!("create client endpoint: {e}"))
}

/// Dev-only TLS config that skips server cert validation; the dev server
/// runs on a self-signed certificate.
fn make_insecure_client_config() -> Result<QuinnClientConfig, String> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"wayfarer-v1".to_vec()];

	let quic_tls =
		quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(|e| format!("build quic tls config: {e}"))?;

	let mut cfg = QuinnClientConfig::new(Arc::new(quic_tls));

	// Control + events streams at minimum.
	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(16));
	transport.max_concurrent_uni_streams(VarInt::from_u32(16));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}
