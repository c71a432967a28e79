#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wayfarer_domain::{UserId, UserRole};

use crate::doc::{DocumentStore, StoreError, UpdateOp};

pub(crate) const USERS: &str = "users";

/// User record as stored by the identity subsystem.
///
/// The chat core reads identity fields and mutates only `online` and
/// `last_seen_unix_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
	pub display_name: String,
	pub role: UserRole,
	pub active: bool,
	#[serde(default)]
	pub online: bool,
	#[serde(default)]
	pub last_seen_unix_ms: i64,
}

/// Online/offline tracking over the shared user collection.
#[derive(Clone)]
pub struct PresenceStore {
	store: Arc<dyn DocumentStore>,
}

impl PresenceStore {
	pub fn new(store: Arc<dyn DocumentStore>) -> Self {
		Self { store }
	}

	pub async fn load_user(&self, id: &UserId) -> Result<Option<UserRecord>, StoreError> {
		let Some(doc) = self.store.get(USERS, id.as_str()).await? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_value(doc)?))
	}

	/// Flip the online flag and stamp last-seen in one atomic update.
	pub async fn set_online(&self, id: &UserId, online: bool, at_unix_ms: i64) -> Result<(), StoreError> {
		self.store
			.update(
				USERS,
				id.as_str(),
				vec![
					UpdateOp::set("online", serde_json::Value::Bool(online)),
					UpdateOp::set("last_seen_unix_ms", serde_json::Value::from(at_unix_ms)),
				],
			)
			.await
	}

	/// Seed a user record. Account provisioning belongs to the identity
	/// subsystem; this is the hook it (and the test fixtures) write through.
	pub async fn insert_user_record(&self, id: &UserId, record: &UserRecord) -> Result<(), StoreError> {
		self.store.create(USERS, id.as_str(), serde_json::to_value(record)?).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::doc::MemStore;

	fn user(id: &str) -> UserId {
		UserId::new(id).expect("valid user id")
	}

	fn record(name: &str) -> UserRecord {
		UserRecord {
			display_name: name.to_string(),
			role: UserRole::User,
			active: true,
			online: false,
			last_seen_unix_ms: 0,
		}
	}

	#[tokio::test]
	async fn online_flag_and_last_seen_update_together() {
		let presence = PresenceStore::new(MemStore::shared());
		let uid = user("u1");
		presence.insert_user_record(&uid, &record("Ana")).await.unwrap();

		presence.set_online(&uid, true, 1_000).await.unwrap();
		let rec = presence.load_user(&uid).await.unwrap().unwrap();
		assert!(rec.online);
		assert_eq!(rec.last_seen_unix_ms, 1_000);

		presence.set_online(&uid, false, 2_000).await.unwrap();
		let rec = presence.load_user(&uid).await.unwrap().unwrap();
		assert!(!rec.online);
		assert_eq!(rec.last_seen_unix_ms, 2_000);
	}

	#[tokio::test]
	async fn missing_user_loads_as_none() {
		let presence = PresenceStore::new(MemStore::shared());
		assert!(presence.load_user(&user("ghost")).await.unwrap().is_none());
	}
}
