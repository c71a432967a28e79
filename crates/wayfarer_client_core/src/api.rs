#![forbid(unsafe_code)]

//! Session abstraction the connection driver runs against. The real
//! implementation lives in [`crate::wire`]; tests inject fakes through the
//! same factory signature.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use wayfarer_protocol::pb;

use crate::{ClientConfig, ClientError};

/// Out-of-band signals from an established session.
#[derive(Debug)]
pub enum SessionNotice {
	/// A broadcast event arrived on the events stream.
	Event(Box<pb::EventEnvelope>),

	/// The server reported an authentication failure for the session.
	AuthError { code: String, message: String },

	/// The transport is gone; the driver decides whether to reconnect.
	Closed(String),
}

/// Why a connect attempt failed.
#[derive(Debug, Clone)]
pub enum ConnectError {
	/// The server rejected the credential with a typed code.
	Auth { code: String, message: String },

	/// Anything else: resolution, timeout, transport, protocol.
	Transport(String),
}

/// A successfully established session.
pub struct ConnectOutcome {
	pub session: BoxedSession,
	pub welcome: pb::Welcome,
	pub notices: mpsc::Receiver<SessionNotice>,
}

/// One established transport session: correlated request/response plus
/// fire-and-forget sends.
pub trait SessionApi: Send + Sync {
	/// Send a request and await its correlated response under `timeout`.
	/// Timing out must detach the pending listener for this request.
	fn request<'a>(
		&'a self,
		msg: pb::envelope::Msg,
		timeout: Duration,
	) -> Pin<Box<dyn Future<Output = Result<pb::envelope::Msg, ClientError>> + Send + 'a>>;

	/// Send an event that is never acked (typing, reactions).
	fn fire<'a>(&'a self, msg: pb::envelope::Msg) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + 'a>>;

	fn close(&self, code: u32, reason: &str);
}

pub type BoxedSession = Arc<dyn SessionApi>;

/// Inputs to one connect attempt.
pub struct ConnectParams {
	pub cfg: ClientConfig,
	pub token: String,
}

/// Produces sessions; the driver owns exactly one in-flight call at a time.
pub type SessionFactory =
	Box<dyn FnMut(ConnectParams) -> Pin<Box<dyn Future<Output = Result<ConnectOutcome, ConnectError>> + Send>> + Send>;
