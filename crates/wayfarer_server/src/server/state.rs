#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use wayfarer_domain::{RoomId, UserId};

/// Per-process registry of live sessions: which user a connection is bound
/// to and which rooms it currently receives fan-out for.
#[derive(Debug, Default)]
pub struct GlobalState {
	users_by_conn: HashMap<u64, UserId>,
	subs_by_conn: HashMap<u64, HashSet<RoomId>>,
}

impl GlobalState {
	/// Bind a connection to its authenticated user.
	pub fn bind_user(&mut self, conn_id: u64, user: UserId) {
		self.users_by_conn.insert(conn_id, user);
	}

	/// All connections currently bound to `user`.
	pub fn conns_for_user(&self, user: &UserId) -> Vec<u64> {
		self.users_by_conn
			.iter()
			.filter(|(_, u)| *u == user)
			.map(|(conn, _)| *conn)
			.collect()
	}

	/// Track a room subscription; returns false if it already existed.
	pub fn subscribe(&mut self, conn_id: u64, room: RoomId) -> bool {
		self.subs_by_conn.entry(conn_id).or_default().insert(room)
	}

	/// Drop a room subscription; returns false if it was not present.
	pub fn unsubscribe(&mut self, conn_id: u64, room: &RoomId) -> bool {
		self.subs_by_conn.get_mut(&conn_id).is_some_and(|set| set.remove(room))
	}

	pub fn is_subscribed(&self, conn_id: u64, room: &RoomId) -> bool {
		self.subs_by_conn.get(&conn_id).is_some_and(|set| set.contains(room))
	}

	/// Remove a closing connection. Returns the bound user and the rooms it
	/// was subscribed to so the session can finish its cleanup.
	pub fn remove_conn(&mut self, conn_id: u64) -> (Option<UserId>, HashSet<RoomId>) {
		let user = self.users_by_conn.remove(&conn_id);
		let rooms = self.subs_by_conn.remove(&conn_id).unwrap_or_default();
		(user, rooms)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn uid(s: &str) -> UserId {
		UserId::new(s).expect("valid user id")
	}

	fn rid(s: &str) -> RoomId {
		RoomId::new(s).expect("valid room id")
	}

	#[test]
	fn subscription_bookkeeping_round_trips() {
		let mut state = GlobalState::default();
		state.bind_user(1, uid("u1"));

		assert!(state.subscribe(1, rid("a")));
		assert!(!state.subscribe(1, rid("a")));
		assert!(state.is_subscribed(1, &rid("a")));
		assert!(!state.is_subscribed(1, &rid("b")));

		assert!(state.unsubscribe(1, &rid("a")));
		assert!(!state.unsubscribe(1, &rid("a")));
	}

	#[test]
	fn remove_conn_returns_user_and_rooms() {
		let mut state = GlobalState::default();
		state.bind_user(7, uid("u1"));
		state.subscribe(7, rid("a"));
		state.subscribe(7, rid("b"));

		let (user, rooms) = state.remove_conn(7);
		assert_eq!(user, Some(uid("u1")));
		assert_eq!(rooms.len(), 2);

		let (user, rooms) = state.remove_conn(7);
		assert!(user.is_none());
		assert!(rooms.is_empty());
	}

	#[test]
	fn conns_for_user_sees_multiple_connections() {
		let mut state = GlobalState::default();
		state.bind_user(1, uid("u1"));
		state.bind_user(2, uid("u1"));
		state.bind_user(3, uid("u2"));

		let mut conns = state.conns_for_user(&uid("u1"));
		conns.sort();
		assert_eq!(conns, vec![1, 2]);
	}
}
