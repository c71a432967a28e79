#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod error;

pub use error::{AuthErrorKind, ChatError, codes};

/// Content written in place of a soft-deleted message body.
pub const DELETED_MESSAGE_PLACEHOLDER: &str = "[message deleted]";

/// Room access classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RoomType {
	Public,
	Private,
	TravelPartner,
}

impl RoomType {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomType::Public => "public",
			RoomType::Private => "private",
			RoomType::TravelPartner => "travel_partner",
		}
	}
}

impl fmt::Display for RoomType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomType {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"public" => Ok(RoomType::Public),
			"private" => Ok(RoomType::Private),
			"travel_partner" | "travel-partner" => Ok(RoomType::TravelPartner),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Role of a user within a single room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RoomRole {
	Member,
	Moderator,
	Admin,
}

impl RoomRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomRole::Member => "member",
			RoomRole::Moderator => "moderator",
			RoomRole::Admin => "admin",
		}
	}

	/// True for roles allowed to run room moderation actions.
	pub const fn can_moderate(self) -> bool {
		matches!(self, RoomRole::Moderator | RoomRole::Admin)
	}
}

impl fmt::Display for RoomRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"member" => Ok(RoomRole::Member),
			"moderator" | "mod" => Ok(RoomRole::Moderator),
			"admin" => Ok(RoomRole::Admin),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Account-level role, owned by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UserRole {
	User,
	Moderator,
	Admin,
}

impl UserRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			UserRole::User => "user",
			UserRole::Moderator => "moderator",
			UserRole::Admin => "admin",
		}
	}
}

impl fmt::Display for UserRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for UserRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"user" => Ok(UserRole::User),
			"moderator" | "mod" => Ok(UserRole::Moderator),
			"admin" => Ok(UserRole::Admin),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Message content classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MessageKind {
	Text,
	Image,
	File,
	System,
	TravelRequest,
}

impl MessageKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Text => "text",
			MessageKind::Image => "image",
			MessageKind::File => "file",
			MessageKind::System => "system",
			MessageKind::TravelRequest => "travel_request",
		}
	}
}

impl fmt::Display for MessageKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for MessageKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"text" => Ok(MessageKind::Text),
			"image" => Ok(MessageKind::Image),
			"file" => Ok(MessageKind::File),
			"system" => Ok(MessageKind::System),
			"travel_request" | "travel-request" => Ok(MessageKind::TravelRequest),
			other => Err(ParseIdError::UnknownVariant(other.to_string())),
		}
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown variant: {0}")]
	UnknownVariant(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Stable user identifier, owned by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Room (chat channel) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected UUID message id, got {s}")))
	}
}

/// Moderation report identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ReportId(pub uuid::Uuid);

impl ReportId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ReportId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}
