#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use wayfarer_domain::RoomId;
use wayfarer_protocol::pb;

/// Per-room hub that fans broadcast events out to subscribed sessions.
#[derive(Debug, Clone)]
pub struct RoomHub {
	inner: Arc<Mutex<Inner>>,
	cfg: RoomHubConfig,
}

/// Configuration for `RoomHub`.
#[derive(Debug, Clone)]
pub struct RoomHubConfig {
	/// Maximum number of queued events per subscriber.
	pub subscriber_queue_capacity: usize,
}

impl Default for RoomHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum RoomHubItem {
	Event(Box<pb::EventEnvelope>),

	/// Indicates the subscriber is lagging and events were dropped.
	Lagged { dropped: u64 },
}

impl RoomHub {
	pub fn new(cfg: RoomHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe a connection to a room. A second subscribe from the same
	/// connection replaces the previous receiver.
	pub async fn subscribe(&self, room: RoomId, conn_id: u64) -> mpsc::Receiver<RoomHubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room.clone()).or_default();

		entry.subscribers.retain(|s| s.conn_id != conn_id && !s.tx.is_closed());
		entry.subscribers.push(Subscriber {
			conn_id,
			tx,
			pending_lag: 0,
		});

		debug!(room = %room, conn_id, subs = entry.subscribers.len(), "room hub: subscribed");

		rx
	}

	/// Detach one connection from a room.
	pub async fn unsubscribe(&self, room: &RoomId, conn_id: u64) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(room) {
			entry.subscribers.retain(|s| s.conn_id != conn_id && !s.tx.is_closed());
			if entry.subscribers.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	/// Publish an event to every subscriber of a room, optionally skipping
	/// the originating connection (joins, leaves and typing indicators are
	/// not echoed back to their sender).
	pub async fn publish(&self, room: &RoomId, event: pb::EventEnvelope, exclude_conn: Option<u64>) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return;
		};

		entry.subscribers.retain(|s| !s.tx.is_closed());
		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
			return;
		}

		let item = RoomHubItem::Event(Box::new(event));
		let mut dropped_total: u64 = 0;

		for sub in entry.subscribers.iter_mut() {
			if Some(sub.conn_id) == exclude_conn {
				continue;
			}

			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0
						&& sub.tx.try_send(RoomHubItem::Lagged { dropped: sub.pending_lag }).is_ok()
					{
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		entry.subscribers.retain(|s| !s.tx.is_closed());
		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
		}

		if dropped_total > 0 {
			metrics::counter!("wayfarer_server_fanout_dropped_total").increment(dropped_total);
			debug!(room = %room, dropped = dropped_total, "room hub: dropped due to full subscriber queues");
		}
	}

	/// Snapshot of live subscriber counts per room.
	pub async fn subscriber_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.tx.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<RoomId, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	conn_id: u64,
	tx: mpsc::Sender<RoomHubItem>,

	/// Events dropped since this subscriber last kept up.
	pending_lag: u64,
}
