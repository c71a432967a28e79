#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use wayfarer_domain::UserId;
use wayfarer_store::{DocumentStore, StoreError, UpdateOp};

const SUBSCRIPTIONS: &str = "subscriptions";

/// Subscription tiers known to the billing subsystem.
const ENTITLED_TIERS: &[&str] = &["explorer", "globetrotter"];

/// Answers "can this user access private-room content" — a capability the
/// chat core consults but never computes.
#[async_trait::async_trait]
pub trait EntitlementProvider: Send + Sync + 'static {
	async fn can_access_private_rooms(&self, user: &UserId) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscriptionDoc {
	tier: String,
}

/// Tier lookup against the subscription collection the billing subsystem
/// maintains. No subscription document means the free tier.
pub struct TierEntitlementProvider {
	store: Arc<dyn DocumentStore>,
}

impl TierEntitlementProvider {
	pub fn new(store: Arc<dyn DocumentStore>) -> Arc<Self> {
		Arc::new(Self { store })
	}

	/// Billing-owned write path, exposed for seeding and tests.
	pub async fn set_tier(&self, user: &UserId, tier: &str) -> Result<(), StoreError> {
		let doc = serde_json::to_value(SubscriptionDoc { tier: tier.to_string() })?;
		match self.store.create(SUBSCRIPTIONS, user.as_str(), doc).await {
			Ok(()) => Ok(()),
			Err(StoreError::AlreadyExists { .. }) => {
				self.store
					.update(
						SUBSCRIPTIONS,
						user.as_str(),
						vec![UpdateOp::set("tier", serde_json::Value::String(tier.to_string()))],
					)
					.await
			}
			Err(e) => Err(e),
		}
	}
}

#[async_trait::async_trait]
impl EntitlementProvider for TierEntitlementProvider {
	async fn can_access_private_rooms(&self, user: &UserId) -> anyhow::Result<bool> {
		let Some(doc) = self.store.get(SUBSCRIPTIONS, user.as_str()).await? else {
			return Ok(false);
		};
		let sub: SubscriptionDoc = serde_json::from_value(doc)?;
		Ok(ENTITLED_TIERS.contains(&sub.tier.as_str()))
	}
}
