#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use wayfarer_services::{ActionKind, EntitlementProvider, IdentityProvider, RateLimiter, RateLimiterConfig};
use wayfarer_store::{DocumentStore, MessageLog, PresenceStore, RoomRegistry};

use crate::config::ChatSettings;
use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::state::GlobalState;

/// Everything a session needs, wired once at startup and shared by all
/// connections.
pub struct ChatDeps {
	pub presence: PresenceStore,
	pub rooms: RoomRegistry,
	pub messages: MessageLog,
	pub identity: Arc<dyn IdentityProvider>,
	pub entitlement: Arc<dyn EntitlementProvider>,
	pub limiter: RateLimiter,
	pub hub: RoomHub,
	pub state: Arc<RwLock<GlobalState>>,
	pub chat: ChatSettings,
}

impl ChatDeps {
	pub fn new(
		store: Arc<dyn DocumentStore>,
		identity: Arc<dyn IdentityProvider>,
		entitlement: Arc<dyn EntitlementProvider>,
		chat: ChatSettings,
	) -> Arc<Self> {
		let mut limits = HashMap::new();
		limits.insert(
			ActionKind::Typing,
			RateLimiterConfig {
				burst: chat.typing_rate_burst,
				per_minute: chat.typing_rate_per_minute,
			},
		);
		limits.insert(
			ActionKind::Reaction,
			RateLimiterConfig {
				burst: chat.reaction_rate_burst,
				per_minute: chat.reaction_rate_per_minute,
			},
		);
		let limiter = RateLimiter::new(limits, chat.rate_limit_idle_expiry);

		Arc::new(Self {
			presence: PresenceStore::new(Arc::clone(&store)),
			rooms: RoomRegistry::new(Arc::clone(&store)),
			messages: MessageLog::new(store),
			identity,
			entitlement,
			limiter,
			hub: RoomHub::new(RoomHubConfig::default()),
			state: Arc::new(RwLock::new(GlobalState::default())),
			chat,
		})
	}
}
