#![forbid(unsafe_code)]

//! External collaborators the chat core consumes but does not implement:
//! identity (bearer-token validation), entitlement (subscription capability
//! checks), and the injected per-user action rate limiter.

use core::fmt;

pub mod entitlement;
pub mod identity;
pub mod rate_limit;

pub use entitlement::{EntitlementProvider, TierEntitlementProvider};
pub use identity::{AuthClaims, HmacIdentityProvider, IdentityError, IdentityProvider, UserIdentity, sign_token, verify_token};
pub use rate_limit::{ActionKind, RateLimiter, RateLimiterConfig, spawn_rate_limit_sweeper};

/// An owned secret that never prints its contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_redacts_debug_and_display() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "hunter2");
	}
}
