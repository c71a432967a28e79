#![forbid(unsafe_code)]

use core::fmt;

use thiserror::Error;

/// Wire codes carried in ack envelopes and handshake errors.
pub mod codes {
	pub const NO_TOKEN: &str = "no-token";
	pub const EXPIRED: &str = "expired";
	pub const INVALID: &str = "invalid";
	pub const ACCOUNT_DEACTIVATED: &str = "account-deactivated";

	pub const UPGRADE_REQUIRED: &str = "upgradeRequired";
	pub const BANNED: &str = "banned";
	pub const PERMISSION_DENIED: &str = "permissionDenied";
	pub const ROOM_FULL: &str = "roomFull";
	pub const EMPTY_CONTENT: &str = "emptyContent";
	pub const CONTENT_TOO_LONG: &str = "contentTooLong";
	pub const NOT_FOUND: &str = "notFound";
	pub const CONFLICT: &str = "conflict";
	pub const RATE_LIMITED: &str = "rateLimited";
	pub const MISSING_FIELD: &str = "missingField";
	pub const INVALID_REPLY: &str = "invalidReply";
}

/// Why a handshake credential was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
	NoToken,
	Expired,
	Invalid,
	Deactivated,
}

impl AuthErrorKind {
	/// Stable wire code for this rejection.
	pub const fn code(self) -> &'static str {
		match self {
			AuthErrorKind::NoToken => codes::NO_TOKEN,
			AuthErrorKind::Expired => codes::EXPIRED,
			AuthErrorKind::Invalid => codes::INVALID,
			AuthErrorKind::Deactivated => codes::ACCOUNT_DEACTIVATED,
		}
	}
}

impl fmt::Display for AuthErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			AuthErrorKind::NoToken => "no token provided",
			AuthErrorKind::Expired => "token expired",
			AuthErrorKind::Invalid => "token invalid",
			AuthErrorKind::Deactivated => "account deactivated",
		};
		f.write_str(msg)
	}
}

/// Error taxonomy for chat-core operations.
///
/// Authentication and permission failures are terminal for the triggering
/// request only; transport failures feed the client reconnect machinery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	#[error("authentication failed: {0}")]
	Authentication(AuthErrorKind),

	#[error("{message}")]
	Permission { message: String, code: &'static str },

	#[error("{message}")]
	Validation { message: String, code: &'static str },

	#[error("{0} not found")]
	NotFound(String),

	#[error("conflict: {0}")]
	Conflict(String),

	#[error("operation timed out: {0}")]
	Timeout(String),

	#[error("transport error: {0}")]
	Transport(String),
}

impl ChatError {
	pub fn permission(message: impl Into<String>, code: &'static str) -> Self {
		ChatError::Permission {
			message: message.into(),
			code,
		}
	}

	pub fn validation(message: impl Into<String>, code: &'static str) -> Self {
		ChatError::Validation {
			message: message.into(),
			code,
		}
	}

	pub fn not_found(what: impl Into<String>) -> Self {
		ChatError::NotFound(what.into())
	}

	/// Wire code for the ack envelope, if one applies.
	pub fn code(&self) -> Option<&'static str> {
		match self {
			ChatError::Authentication(kind) => Some(kind.code()),
			ChatError::Permission { code, .. } => Some(code),
			ChatError::Validation { code, .. } => Some(code),
			ChatError::NotFound(_) => Some(codes::NOT_FOUND),
			ChatError::Conflict(_) => Some(codes::CONFLICT),
			ChatError::Timeout(_) | ChatError::Transport(_) => None,
		}
	}
}
