#![forbid(unsafe_code)]

//! Conversions between domain enums and their wire representations, plus
//! envelope/ack constructors shared by client and server.

use wayfarer_domain::{ChatError, MessageKind, RoomRole, RoomType, UserRole};

use crate::pb;
use crate::version::PROTOCOL_VERSION;

/// Wrap a message in a versioned envelope.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

/// Successful ack with no payload.
pub fn ack_success() -> pb::Ack {
	pb::Ack {
		success: true,
		message: String::new(),
		code: String::new(),
		data: None,
	}
}

/// Successful ack carrying operation data.
pub fn ack_success_with(data: pb::ack::Data) -> pb::Ack {
	pb::Ack {
		success: true,
		message: String::new(),
		code: String::new(),
		data: Some(data),
	}
}

/// Failed ack derived from a [`ChatError`].
pub fn ack_failure(err: &ChatError) -> pb::Ack {
	pb::Ack {
		success: false,
		message: err.to_string(),
		code: err.code().unwrap_or_default().to_string(),
		data: None,
	}
}

pub fn room_type_to_wire(t: RoomType) -> pb::RoomType {
	match t {
		RoomType::Public => pb::RoomType::Public,
		RoomType::Private => pb::RoomType::Private,
		RoomType::TravelPartner => pb::RoomType::TravelPartner,
	}
}

pub fn room_type_from_wire(v: i32) -> Option<RoomType> {
	match pb::RoomType::try_from(v).ok()? {
		pb::RoomType::Unspecified => None,
		pb::RoomType::Public => Some(RoomType::Public),
		pb::RoomType::Private => Some(RoomType::Private),
		pb::RoomType::TravelPartner => Some(RoomType::TravelPartner),
	}
}

pub fn room_role_to_wire(r: RoomRole) -> pb::RoomRole {
	match r {
		RoomRole::Member => pb::RoomRole::Member,
		RoomRole::Moderator => pb::RoomRole::Moderator,
		RoomRole::Admin => pb::RoomRole::Admin,
	}
}

pub fn room_role_from_wire(v: i32) -> Option<RoomRole> {
	match pb::RoomRole::try_from(v).ok()? {
		pb::RoomRole::Unspecified => None,
		pb::RoomRole::Member => Some(RoomRole::Member),
		pb::RoomRole::Moderator => Some(RoomRole::Moderator),
		pb::RoomRole::Admin => Some(RoomRole::Admin),
	}
}

pub fn user_role_to_wire(r: UserRole) -> pb::UserRole {
	match r {
		UserRole::User => pb::UserRole::User,
		UserRole::Moderator => pb::UserRole::Moderator,
		UserRole::Admin => pb::UserRole::Admin,
	}
}

pub fn user_role_from_wire(v: i32) -> Option<UserRole> {
	match pb::UserRole::try_from(v).ok()? {
		pb::UserRole::Unspecified => None,
		pb::UserRole::User => Some(UserRole::User),
		pb::UserRole::Moderator => Some(UserRole::Moderator),
		pb::UserRole::Admin => Some(UserRole::Admin),
	}
}

pub fn message_kind_to_wire(k: MessageKind) -> pb::MessageKind {
	match k {
		MessageKind::Text => pb::MessageKind::Text,
		MessageKind::Image => pb::MessageKind::Image,
		MessageKind::File => pb::MessageKind::File,
		MessageKind::System => pb::MessageKind::System,
		MessageKind::TravelRequest => pb::MessageKind::TravelRequest,
	}
}

/// Unspecified falls back to `text`, which is what loose clients send.
pub fn message_kind_from_wire(v: i32) -> MessageKind {
	match pb::MessageKind::try_from(v).unwrap_or(pb::MessageKind::Unspecified) {
		pb::MessageKind::Unspecified | pb::MessageKind::Text => MessageKind::Text,
		pb::MessageKind::Image => MessageKind::Image,
		pb::MessageKind::File => MessageKind::File,
		pb::MessageKind::System => MessageKind::System,
		pb::MessageKind::TravelRequest => MessageKind::TravelRequest,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wayfarer_domain::codes;

	#[test]
	fn room_type_wire_roundtrip() {
		for t in [RoomType::Public, RoomType::Private, RoomType::TravelPartner] {
			assert_eq!(room_type_from_wire(room_type_to_wire(t) as i32), Some(t));
		}
		assert_eq!(room_type_from_wire(0), None);
		assert_eq!(room_type_from_wire(999), None);
	}

	#[test]
	fn room_role_wire_roundtrip() {
		for r in [RoomRole::Member, RoomRole::Moderator, RoomRole::Admin] {
			assert_eq!(room_role_from_wire(room_role_to_wire(r) as i32), Some(r));
		}
	}

	#[test]
	fn unspecified_message_kind_defaults_to_text() {
		assert_eq!(message_kind_from_wire(0), MessageKind::Text);
		assert_eq!(message_kind_from_wire(-3), MessageKind::Text);
	}

	#[test]
	fn failure_ack_carries_message_and_code() {
		let err = ChatError::permission("private rooms require an active subscription", codes::UPGRADE_REQUIRED);
		let ack = ack_failure(&err);
		assert!(!ack.success);
		assert_eq!(ack.code, "upgradeRequired");
		assert!(ack.message.contains("subscription"));
	}

	#[test]
	fn envelope_carries_version_and_request_id() {
		let env = envelope("req-7", pb::envelope::Msg::Ack(ack_success()));
		assert_eq!(env.version, PROTOCOL_VERSION);
		assert_eq!(env.request_id, "req-7");
		assert!(matches!(env.msg, Some(pb::envelope::Msg::Ack(a)) if a.success));
	}
}
