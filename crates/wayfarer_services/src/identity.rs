#![forbid(unsafe_code)]

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use wayfarer_domain::{AuthErrorKind, UserId, UserRole};
use wayfarer_store::PresenceStore;

use crate::SecretString;

/// Claims carried inside a `v1.<payload>.<sig>` bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Active-user record returned by a successful token resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
	pub id: UserId,
	pub display_name: String,
	pub role: UserRole,
	pub last_seen_unix_ms: i64,
}

#[derive(Debug, Error)]
pub enum IdentityError {
	#[error("{0}")]
	Rejected(AuthErrorKind),

	#[error("identity backend error: {0}")]
	Backend(String),
}

impl IdentityError {
	/// The wire code a handshake rejection closes with. Backend faults are
	/// reported to the client as a plain invalid credential.
	pub fn auth_kind(&self) -> AuthErrorKind {
		match self {
			IdentityError::Rejected(kind) => *kind,
			IdentityError::Backend(_) => AuthErrorKind::Invalid,
		}
	}
}

/// Validates a bearer token and returns the active-user record.
///
/// The chat core treats this as a single lookup it cannot implement itself.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
	async fn resolve_token(&self, token: &str) -> Result<UserIdentity, IdentityError>;
}

/// Sign a `v1.<payload>.<sig>` token over `{sub, exp}` claims.
pub fn sign_token(sub: &str, exp_unix_secs: u64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp: exp_unix_secs,
	};
	let payload = serde_json::to_vec(&claims).expect("serialize flat claims struct");
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	format!("v1.{payload_b64}.{sig_b64}")
}

/// Verify token format, signature and expiry against `now`.
pub fn verify_token(token: &str, secret: &str, now_unix_secs: u64) -> Result<AuthClaims, AuthErrorKind> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthErrorKind::Invalid);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthErrorKind::Invalid)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthErrorKind::Invalid)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthErrorKind::Invalid);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthErrorKind::Invalid)?;
	if claims.exp <= now_unix_secs {
		return Err(AuthErrorKind::Expired);
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// HMAC-token identity backed by the shared user collection.
pub struct HmacIdentityProvider {
	secret: SecretString,
	presence: PresenceStore,
}

impl HmacIdentityProvider {
	pub fn new(secret: SecretString, presence: PresenceStore) -> Arc<Self> {
		Arc::new(Self { secret, presence })
	}
}

#[async_trait::async_trait]
impl IdentityProvider for HmacIdentityProvider {
	async fn resolve_token(&self, token: &str) -> Result<UserIdentity, IdentityError> {
		let token = token.trim();
		if token.is_empty() {
			return Err(IdentityError::Rejected(AuthErrorKind::NoToken));
		}

		let claims = verify_token(token, self.secret.expose(), wayfarer_util::time::unix_secs_now())
			.map_err(IdentityError::Rejected)?;

		let id = UserId::new(claims.sub).map_err(|_| IdentityError::Rejected(AuthErrorKind::Invalid))?;

		let record = self
			.presence
			.load_user(&id)
			.await
			.map_err(|e| IdentityError::Backend(e.to_string()))?
			.ok_or(IdentityError::Rejected(AuthErrorKind::Deactivated))?;

		if !record.active {
			return Err(IdentityError::Rejected(AuthErrorKind::Deactivated));
		}

		Ok(UserIdentity {
			id,
			display_name: record.display_name,
			role: record.role,
			last_seen_unix_ms: record.last_seen_unix_ms,
		})
	}
}
